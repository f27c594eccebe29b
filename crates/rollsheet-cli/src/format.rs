//! Text formatting helpers for terminal output.

use chrono::{DateTime, Utc};
use rollsheet_core::sync::SyncState;
use rollsheet_core::Member;

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format an optional string, returning a default if None
pub fn format_optional(value: Option<&str>, default: &str) -> String {
    value.unwrap_or(default).to_string()
}

pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%b %d, %Y %H:%M UTC").to_string(),
        None => "never".to_string(),
    }
}

pub fn format_average(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1}", v),
        None => "-".to_string(),
    }
}

pub fn member_line(member: &Member) -> String {
    let status = if member.active { "" } else { " (inactive)" };
    format!(
        "{:<12} {:<28} {:<16}{}",
        truncate_string(&member.member_id, 12),
        truncate_string(&member.display_name, 28),
        format_optional(member.group.as_deref(), "-"),
        status
    )
}

pub fn sync_lines(state: &SyncState) -> Vec<String> {
    let mut lines = vec![
        format!("Phase:       {:?}", state.phase),
        format!("Last read:   {}", format_timestamp(state.last_read_at)),
        format!("Last write:  {}", format_timestamp(state.last_write_at)),
        format!("Pending:     {}", state.pending),
    ];
    if state.error_count > 0 {
        lines.push(format!(
            "Errors:      {} ({})",
            state.error_count,
            format_optional(state.last_error.as_deref(), "unknown")
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello", 10), "Hello");
        assert_eq!(truncate_string("Hello World", 8), "Hello...");
        assert_eq!(truncate_string("Hi", 2), "Hi");
        assert_eq!(truncate_string("Chiọma Okafor", 9), "Chiọma...");
    }

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 3, 9, 5, 0).unwrap();
        assert_eq!(format_timestamp(Some(ts)), "Mar 03, 2024 09:05 UTC");
        assert_eq!(format_timestamp(None), "never");
    }

    #[test]
    fn test_member_line_marks_inactive() {
        let mut member = Member::new("m-1", "Ruth").with_group("Choir");
        assert!(!member_line(&member).contains("inactive"));
        member.active = false;
        assert!(member_line(&member).ends_with("(inactive)"));
    }

    #[test]
    fn test_sync_lines_show_errors_only_when_present() {
        let mut state = SyncState::default();
        assert_eq!(sync_lines(&state).len(), 4);
        state.error_count = 2;
        state.last_error = Some("offline".into());
        assert!(sync_lines(&state)[4].contains("offline"));
    }
}
