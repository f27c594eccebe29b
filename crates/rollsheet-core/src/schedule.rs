//! Which dates services are held on.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, Weekday};

use crate::config::ScheduleConfig;

/// Weekly service days plus one-off additions and cancellations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSchedule {
    service_days: Vec<Weekday>,
    extra_dates: BTreeSet<NaiveDate>,
    cancelled_dates: BTreeSet<NaiveDate>,
}

impl ServiceSchedule {
    pub fn weekly(days: &[Weekday]) -> Self {
        Self {
            service_days: days.to_vec(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self {
            service_days: config.service_days.clone(),
            extra_dates: config.extra_dates.iter().copied().collect(),
            cancelled_dates: config.cancelled_dates.iter().copied().collect(),
        }
    }

    pub fn with_extra(mut self, date: NaiveDate) -> Self {
        self.extra_dates.insert(date);
        self
    }

    pub fn with_cancelled(mut self, date: NaiveDate) -> Self {
        self.cancelled_dates.insert(date);
        self
    }

    pub fn is_service_day(&self, date: NaiveDate) -> bool {
        if self.cancelled_dates.contains(&date) {
            return false;
        }
        self.extra_dates.contains(&date) || self.service_days.contains(&date.weekday())
    }

    /// Service dates in `[start, end]`, ascending. Empty if `start > end`.
    pub fn services_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if start > end {
            return Vec::new();
        }
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| self.is_service_day(*d))
            .collect()
    }
}
