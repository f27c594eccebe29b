use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Where an attendance record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Manual,
    Import,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Some(Source::Manual),
            "import" => Some(Source::Import),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an attendance record: one per member per service date.
///
/// Ordered by date first so a sorted collection reads chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub date: NaiveDate,
    pub member_id: String,
}

impl RecordKey {
    pub fn new(member_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            date,
            member_id: member_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.member_id, self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub member_id: String,
    pub date: NaiveDate,
    pub present: bool,
    pub recorded_at: DateTime<Utc>,
    pub source: Source,
}

impl AttendanceRecord {
    /// A manually entered record.
    pub fn new(
        member_id: impl Into<String>,
        date: NaiveDate,
        present: bool,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            date,
            present,
            recorded_at,
            source: Source::Manual,
        }
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.member_id.clone(), self.date)
    }

    /// Last-writer-wins: `self` replaces `other` only when recorded strictly later.
    pub fn supersedes(&self, other: &AttendanceRecord) -> bool {
        self.recorded_at > other.recorded_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(hour: u32) -> AttendanceRecord {
        AttendanceRecord::new(
            "m-001",
            NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
            true,
            Utc.with_ymd_and_hms(2024, 3, 3, hour, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_supersedes_is_strict() {
        let early = record(9);
        let late = record(10);
        assert!(late.supersedes(&early));
        assert!(!early.supersedes(&late));
        assert!(!early.supersedes(&early.clone()));
    }

    #[test]
    fn test_record_key_orders_by_date_then_member() {
        let a = RecordKey::new("zed", NaiveDate::from_ymd_opt(2024, 1, 7).unwrap());
        let b = RecordKey::new("abe", NaiveDate::from_ymd_opt(2024, 1, 14).unwrap());
        assert!(a < b);
        assert_eq!(a.to_string(), "zed@2024-01-07");
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(Source::parse(" Import "), Some(Source::Import));
        assert_eq!(Source::parse("manual"), Some(Source::Manual));
        assert_eq!(Source::parse("api"), None);
    }
}
