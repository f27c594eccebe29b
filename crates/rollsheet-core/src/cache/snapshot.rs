use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{AttendanceRecord, Member, RecordKey};

/// An immutable, complete view of the remote data at one point in time.
///
/// Readers hold an `Arc<Snapshot>`; a refresh publishes a new one instead of
/// mutating this one.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    fetched_at: DateTime<Utc>,
    records: BTreeMap<RecordKey, AttendanceRecord>,
    members: BTreeMap<String, Member>,
}

impl Snapshot {
    pub fn new(
        version: u64,
        fetched_at: DateTime<Utc>,
        records: Vec<AttendanceRecord>,
        members: Vec<Member>,
    ) -> Self {
        let mut snapshot = Self {
            version,
            fetched_at,
            records: BTreeMap::new(),
            members: members
                .into_iter()
                .map(|m| (m.member_id.clone(), m))
                .collect(),
        };
        for record in records {
            snapshot.merge_record(record);
        }
        snapshot
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Records in key order (date, then member).
    pub fn records(&self) -> impl Iterator<Item = &AttendanceRecord> {
        self.records.values()
    }

    pub fn record(&self, key: &RecordKey) -> Option<&AttendanceRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn member(&self, member_id: &str) -> Option<&Member> {
        self.members.get(member_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// True when `member_id` exists and is not deactivated.
    pub fn is_active_member(&self, member_id: &str) -> bool {
        self.member(member_id).is_some_and(|m| m.active)
    }

    /// Insert under last-writer-wins. Returns whether the record was taken.
    fn merge_record(&mut self, record: AttendanceRecord) -> bool {
        let key = record.key();
        match self.records.get(&key) {
            Some(existing) if !record.supersedes(existing) => false,
            _ => {
                self.records.insert(key, record);
                true
            }
        }
    }

    /// A copy with `record` merged in, under a new version. The fetch time is
    /// kept: local writes do not make the remote view any fresher.
    pub fn with_record(&self, record: AttendanceRecord, version: u64) -> Option<Self> {
        let mut next = self.clone();
        if next.merge_record(record) {
            next.version = version;
            Some(next)
        } else {
            None
        }
    }

    pub fn with_member(&self, member: Member, version: u64) -> Self {
        let mut next = self.clone();
        next.members.insert(member.member_id.clone(), member);
        next.version = version;
        next
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.fetched_at
    }

    /// Fresh while younger than `window`. A fetch time in the future counts as fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.age_at(now).to_std() {
            Ok(age) => age < window,
            Err(_) => true,
        }
    }

    pub fn age_minutes_at(&self, now: DateTime<Utc>) -> i64 {
        self.age_at(now).num_minutes()
    }

    pub fn age_display_at(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes_at(now);
        if minutes < 1 {
            // Includes clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            let remaining_mins = minutes % 60;
            if remaining_mins >= 30 {
                // Round up: 1h 30m+ becomes 2h
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            let remaining_hours = (minutes % 1440) / 60;
            if remaining_hours >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 3, hour, minute, 0).unwrap()
    }

    fn record(hour: u32, present: bool) -> AttendanceRecord {
        AttendanceRecord::new("m-1", NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(), present, at(hour, 0))
    }

    #[test]
    fn test_new_collapses_duplicates_by_recorded_at() {
        let snap = Snapshot::new(1, at(12, 0), vec![record(10, true), record(9, false)], vec![]);
        assert_eq!(snap.len(), 1);
        assert!(snap.records().next().unwrap().present);
    }

    #[test]
    fn test_with_record_keeps_fetch_time_and_bumps_version() {
        let snap = Snapshot::new(1, at(12, 0), vec![record(9, false)], vec![]);
        let next = snap.with_record(record(10, true), 2).unwrap();
        assert_eq!(next.version(), 2);
        assert_eq!(next.fetched_at(), snap.fetched_at());
        assert!(snap.with_record(record(8, true), 3).is_none());
        // original untouched
        assert!(!snap.records().next().unwrap().present);
    }

    #[test]
    fn test_freshness_window() {
        let snap = Snapshot::new(1, at(12, 0), vec![], vec![]);
        let window = Duration::from_secs(300);
        assert!(snap.is_fresh_at(at(12, 4), window));
        assert!(!snap.is_fresh_at(at(12, 5), window));
        assert!(snap.is_fresh_at(at(11, 0), window));
    }

    #[test]
    fn test_age_display() {
        let snap = Snapshot::new(1, at(10, 0), vec![], vec![]);
        assert_eq!(snap.age_display_at(at(10, 0)), "just now");
        assert_eq!(snap.age_display_at(at(10, 5)), "5m ago");
        assert_eq!(snap.age_display_at(at(11, 40)), "2h ago");
        assert_eq!(snap.age_display_at(at(9, 0)), "just now");
    }

    #[test]
    fn test_inactive_member_is_not_active() {
        let mut gone = Member::new("m-2", "Former");
        gone.active = false;
        let snap = Snapshot::new(1, at(10, 0), vec![], vec![Member::new("m-1", "Ruth"), gone]);
        assert!(snap.is_active_member("m-1"));
        assert!(!snap.is_active_member("m-2"));
        assert!(!snap.is_active_member("m-3"));
    }
}
