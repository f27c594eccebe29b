//! Derived attendance metrics.
//!
//! Everything here is a pure function of a snapshot, the service schedule
//! and a date window. Nothing is stored; dashboards recompute on each read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::cache::Snapshot;
use crate::models::{AggregateMetric, AttendanceRecord, MemberRate, MetricInputs, MetricValue};
use crate::schedule::ServiceSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendBucket {
    /// Weeks starting on Sunday
    Weekly,
    Monthly,
}

impl TrendBucket {
    pub fn bucket_start(&self, date: NaiveDate) -> NaiveDate {
        match self {
            TrendBucket::Weekly => date.week(Weekday::Sun).first_day(),
            TrendBucket::Monthly => date.with_day(1).unwrap_or(date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub bucket_start: NaiveDate,
    pub services: u32,
    pub present: u32,
    /// Present count per scheduled service; `None` when the bucket had no services.
    pub average_per_service: Option<f64>,
}

pub struct AggregationEngine<'a> {
    snapshot: &'a Snapshot,
    schedule: &'a ServiceSchedule,
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl<'a> AggregationEngine<'a> {
    pub fn new(snapshot: &'a Snapshot, schedule: &'a ServiceSchedule) -> Self {
        Self { snapshot, schedule }
    }

    fn inputs(&self) -> MetricInputs {
        MetricInputs {
            snapshot_version: self.snapshot.version(),
            fetched_at: self.snapshot.fetched_at(),
        }
    }

    fn in_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Iterator<Item = &'a AttendanceRecord> + 'a {
        self.snapshot
            .records()
            .filter(move |r| r.date >= start && r.date <= end)
    }

    fn services(&self, start: NaiveDate, end: NaiveDate) -> BTreeSet<NaiveDate> {
        self.schedule.services_between(start, end).into_iter().collect()
    }

    /// Present records on scheduled services over scheduled services.
    /// Attendance on unscheduled dates does not count, so the rate stays in [0, 1].
    pub fn member_rate(&self, member_id: &str, start: NaiveDate, end: NaiveDate) -> MemberRate {
        let services = self.services(start, end);
        let attended = self
            .in_window(start, end)
            .filter(|r| r.member_id == member_id && r.present && services.contains(&r.date))
            .count();
        MemberRate::from_counts(count(attended), count(services.len()))
    }

    /// Present count per date. Scheduled services with nobody recorded appear as 0.
    pub fn period_totals(&self, start: NaiveDate, end: NaiveDate) -> BTreeMap<NaiveDate, u32> {
        let mut totals: BTreeMap<NaiveDate, u32> =
            self.services(start, end).into_iter().map(|d| (d, 0)).collect();
        for record in self.in_window(start, end).filter(|r| r.present) {
            *totals.entry(record.date).or_insert(0) += 1;
        }
        totals
    }

    /// Present count per member group label.
    pub fn group_totals(&self, start: NaiveDate, end: NaiveDate) -> BTreeMap<String, u32> {
        let mut totals = BTreeMap::new();
        for record in self.in_window(start, end).filter(|r| r.present) {
            let label = self
                .snapshot
                .member(&record.member_id)
                .map_or("Unknown", |m| m.group_label())
                .to_string();
            *totals.entry(label).or_insert(0) += 1;
        }
        totals
    }

    pub fn trend(&self, start: NaiveDate, end: NaiveDate, bucket: TrendBucket) -> Vec<TrendPoint> {
        let mut buckets: BTreeMap<NaiveDate, (u32, u32)> = BTreeMap::new();
        for (date, present) in self.period_totals(start, end) {
            let entry = buckets.entry(bucket.bucket_start(date)).or_insert((0, 0));
            if self.schedule.is_service_day(date) {
                entry.0 += 1;
            }
            entry.1 += present;
        }
        buckets
            .into_iter()
            .map(|(bucket_start, (services, present))| TrendPoint {
                bucket_start,
                services,
                present,
                average_per_service: (services > 0)
                    .then(|| f64::from(present) / f64::from(services)),
            })
            .collect()
    }

    fn metric(
        &self,
        name: &str,
        member_id: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
        value: MetricValue,
    ) -> AggregateMetric {
        AggregateMetric {
            name: name.to_string(),
            member_id: member_id.map(str::to_string),
            period_start: start,
            period_end: end,
            value,
            computed_from: self.inputs(),
        }
    }

    pub fn member_report(&self, member_id: &str, start: NaiveDate, end: NaiveDate) -> Vec<AggregateMetric> {
        let rate = self.member_rate(member_id, start, end);
        let (attended, scheduled) = match rate {
            MemberRate::Rate { attended, expected } => (attended, expected),
            MemberRate::Undefined => (0, 0),
        };
        let absences = self
            .in_window(start, end)
            .filter(|r| r.member_id == member_id && !r.present)
            .count();

        let id = Some(member_id);
        vec![
            self.metric("attendance_rate", id, start, end, MetricValue::Rate(rate)),
            self.metric("services_attended", id, start, end, MetricValue::Count(attended)),
            self.metric("services_scheduled", id, start, end, MetricValue::Count(scheduled)),
            self.metric("absences_recorded", id, start, end, MetricValue::Count(count(absences))),
        ]
    }

    /// Congregation-wide figures for the dashboard.
    pub fn dashboard_metrics(&self, start: NaiveDate, end: NaiveDate) -> Vec<AggregateMetric> {
        let services = self.services(start, end);
        let active: BTreeSet<&str> = self
            .snapshot
            .members()
            .filter(|m| m.active)
            .map(|m| m.member_id.as_str())
            .collect();
        let present: Vec<&AttendanceRecord> =
            self.in_window(start, end).filter(|r| r.present).collect();
        let attended_by_active = present
            .iter()
            .filter(|r| active.contains(r.member_id.as_str()) && services.contains(&r.date))
            .count();
        let rate = MemberRate::from_counts(
            count(attended_by_active),
            count(active.len().saturating_mul(services.len())),
        );

        vec![
            self.metric("active_members", None, start, end, MetricValue::Count(count(active.len()))),
            self.metric("services_held", None, start, end, MetricValue::Count(count(services.len()))),
            self.metric("present_total", None, start, end, MetricValue::Count(count(present.len()))),
            self.metric("congregation_rate", None, start, end, MetricValue::Rate(rate)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Member;
    use chrono::{DateTime, TimeZone, Utc};

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    fn present(member: &str, d: NaiveDate) -> AttendanceRecord {
        AttendanceRecord::new(member, d, true, ts())
    }

    fn snapshot(records: Vec<AttendanceRecord>) -> Snapshot {
        Snapshot::new(
            7,
            ts(),
            records,
            vec![
                Member::new("ruth", "Ruth").with_group("Choir"),
                Member::new("ade", "Ade"),
            ],
        )
    }

    fn sundays() -> ServiceSchedule {
        ServiceSchedule::weekly(&[Weekday::Sun])
    }

    #[test]
    fn test_member_rate_three_of_four() {
        // Sundays 3, 10, 17, 24 March
        let snap = snapshot(vec![
            present("ruth", date(3, 3)),
            present("ruth", date(3, 10)),
            AttendanceRecord::new("ruth", date(3, 17), false, ts()),
            present("ruth", date(3, 24)),
        ]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let rate = engine.member_rate("ruth", date(3, 1), date(3, 30));
        assert_eq!(rate.value(), Some(0.75));
    }

    #[test]
    fn test_member_rate_undefined_without_services() {
        let snap = snapshot(vec![present("ruth", date(3, 5))]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        // Monday through Saturday: no services
        assert_eq!(engine.member_rate("ruth", date(3, 4), date(3, 9)), MemberRate::Undefined);
    }

    #[test]
    fn test_unscheduled_attendance_does_not_inflate_rate() {
        let snap = snapshot(vec![present("ruth", date(3, 3)), present("ruth", date(3, 6))]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let rate = engine.member_rate("ruth", date(3, 1), date(3, 9));
        assert_eq!(rate, MemberRate::Rate { attended: 1, expected: 1 });
    }

    #[test]
    fn test_period_totals_include_empty_services() {
        let snap = snapshot(vec![present("ruth", date(3, 3)), present("ade", date(3, 3))]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let totals = engine.period_totals(date(3, 1), date(3, 12));
        assert_eq!(totals.get(&date(3, 3)), Some(&2));
        assert_eq!(totals.get(&date(3, 10)), Some(&0));
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn test_group_totals() {
        let snap = snapshot(vec![
            present("ruth", date(3, 3)),
            present("ade", date(3, 3)),
            present("visitor", date(3, 3)),
        ]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let totals = engine.group_totals(date(3, 1), date(3, 31));
        assert_eq!(totals.get("Choir"), Some(&1));
        assert_eq!(totals.get("Ungrouped"), Some(&1));
        assert_eq!(totals.get("Unknown"), Some(&1));
    }

    #[test]
    fn test_weekly_trend() {
        let snap = snapshot(vec![
            present("ruth", date(3, 3)),
            present("ade", date(3, 3)),
            present("ruth", date(3, 10)),
        ]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let trend = engine.trend(date(3, 1), date(3, 16), TrendBucket::Weekly);

        // Week of 25 Feb holds 1-2 March only, no services
        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].bucket_start, date(3, 3));
        assert_eq!(trend[0].present, 2);
        assert_eq!(trend[0].average_per_service, Some(2.0));
        assert_eq!(trend[1].present, 1);
    }

    #[test]
    fn test_member_report_carries_snapshot_version() {
        let snap = snapshot(vec![present("ruth", date(3, 3))]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let report = engine.member_report("ruth", date(3, 1), date(3, 9));

        assert_eq!(report.len(), 4);
        assert_eq!(report[0].name, "attendance_rate");
        assert_eq!(report[0].computed_from.snapshot_version, 7);
        assert!(report[0].is_outdated(8));
        assert_eq!(report[1].value, MetricValue::Count(1));
    }

    #[test]
    fn test_dashboard_rate_counts_active_members() {
        let snap = snapshot(vec![present("ruth", date(3, 3))]);
        let schedule = sundays();
        let engine = AggregationEngine::new(&snap, &schedule);
        let metrics = engine.dashboard_metrics(date(3, 1), date(3, 9));
        let rate = metrics.iter().find(|m| m.name == "congregation_rate").unwrap();
        assert_eq!(rate.value, MetricValue::Rate(MemberRate::Rate { attended: 1, expected: 2 }));
    }
}
