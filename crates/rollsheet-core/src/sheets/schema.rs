//! Worksheet layout and row translation.
//!
//! This is the only place that knows about columns. Everything above the
//! adapter works with `AttendanceRecord` and `Member`.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use super::RemoteError;
use crate::models::{AttendanceRecord, Member, Source};

/// One worksheet row as cell strings.
pub type Row = Vec<String>;

pub const ATTENDANCE_HEADER: [&str; 5] = ["member_id", "date", "present", "recorded_at", "source"];

pub const MEMBERS_HEADER: [&str; 4] = ["member_id", "display_name", "group", "active"];

/// Data rows of a worksheet with their row index (header is index 0).
pub type IndexedRows = Vec<(usize, Row)>;

/// Verify the header row and return the data rows.
///
/// An empty worksheet is an empty table. Blank rows are skipped. Cells
/// missing at the end of a row (the API omits trailing empties) are padded.
pub fn split_table(sheet: &str, expected: &[&str], rows: Vec<Row>) -> Result<IndexedRows, RemoteError> {
    let mut rows = rows.into_iter().enumerate();
    let header = match rows.next() {
        Some((_, header)) if !is_blank(&header) => header,
        Some(_) => {
            return Err(RemoteError::SchemaMismatch(format!(
                "{}: first row is blank, expected header {:?}",
                sheet, expected
            )))
        }
        None => return Ok(Vec::new()),
    };
    check_header(sheet, expected, &header)?;

    Ok(rows
        .filter(|(_, row)| !is_blank(row))
        .map(|(index, mut row)| {
            if row.len() < expected.len() {
                row.resize(expected.len(), String::new());
            }
            (index, row)
        })
        .collect())
}

/// Column names must match in order, ignoring case and surrounding space.
/// Extra trailing empty header cells are tolerated.
pub fn check_header(sheet: &str, expected: &[&str], actual: &[String]) -> Result<(), RemoteError> {
    let trimmed: Vec<String> = actual
        .iter()
        .map(|c| c.trim().to_ascii_lowercase())
        .collect();
    let significant = trimmed
        .iter()
        .rposition(|c| !c.is_empty())
        .map_or(0, |last| last + 1);

    let matches = significant == expected.len()
        && trimmed.iter().zip(expected).all(|(got, want)| got == want);
    if matches {
        Ok(())
    } else {
        Err(RemoteError::SchemaMismatch(format!(
            "{}: expected columns {:?}, found {:?}",
            sheet,
            expected,
            &trimmed[..significant]
        )))
    }
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn flag(value: bool) -> String {
    let cell = if value { "1" } else { "0" };
    cell.to_string()
}

pub fn record_from_row(row: &[String]) -> Result<AttendanceRecord, String> {
    if row.len() < ATTENDANCE_HEADER.len() {
        return Err(format!("expected {} cells, found {}", ATTENDANCE_HEADER.len(), row.len()));
    }
    let member_id = row[0].trim();
    if member_id.is_empty() {
        return Err("empty member_id".to_string());
    }
    let date = NaiveDate::parse_from_str(row[1].trim(), "%Y-%m-%d")
        .map_err(|e| format!("bad date {:?}: {}", row[1], e))?;
    let present = parse_flag(&row[2]).ok_or_else(|| format!("bad present flag {:?}", row[2]))?;
    let recorded_at = DateTime::parse_from_rfc3339(row[3].trim())
        .map_err(|e| format!("bad recorded_at {:?}: {}", row[3], e))?
        .with_timezone(&Utc);
    let source = Source::parse(&row[4]).ok_or_else(|| format!("bad source {:?}", row[4]))?;

    Ok(AttendanceRecord {
        member_id: member_id.to_string(),
        date,
        present,
        recorded_at,
        source,
    })
}

pub fn record_to_row(record: &AttendanceRecord) -> Row {
    vec![
        record.member_id.clone(),
        record.date.format("%Y-%m-%d").to_string(),
        flag(record.present),
        record.recorded_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        record.source.as_str().to_string(),
    ]
}

pub fn member_from_row(row: &[String]) -> Result<Member, String> {
    if row.len() < MEMBERS_HEADER.len() {
        return Err(format!("expected {} cells, found {}", MEMBERS_HEADER.len(), row.len()));
    }
    let member_id = row[0].trim();
    if member_id.is_empty() {
        return Err("empty member_id".to_string());
    }
    let group = Some(row[2].trim())
        .filter(|g| !g.is_empty())
        .map(str::to_string);
    let active = if row[3].trim().is_empty() {
        true
    } else {
        parse_flag(&row[3]).ok_or_else(|| format!("bad active flag {:?}", row[3]))?
    };

    Ok(Member {
        member_id: member_id.to_string(),
        display_name: row[1].trim().to_string(),
        group,
        active,
    })
}

pub fn member_to_row(member: &Member) -> Row {
    vec![
        member.member_id.clone(),
        member.display_name.clone(),
        member.group.clone().unwrap_or_default(),
        flag(member.active),
    ]
}

/// Parse every data row, reporting the sheet row number of the first bad one.
pub fn parse_rows<T>(
    sheet: &str,
    rows: IndexedRows,
    parse: impl Fn(&[String]) -> Result<T, String>,
) -> Result<Vec<(usize, T)>, RemoteError> {
    rows.into_iter()
        .map(|(index, row)| {
            parse(&row).map(|value| (index, value)).map_err(|reason| {
                RemoteError::SchemaMismatch(format!("{} row {}: {}", sheet, index + 1, reason))
            })
        })
        .collect()
}

pub fn header_row(columns: &[&str]) -> Row {
    columns.iter().map(|c| c.to_string()).collect()
}
