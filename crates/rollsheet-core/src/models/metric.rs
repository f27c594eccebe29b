use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Attendance rate over a window.
///
/// `Undefined` means no services were scheduled in the window. It is never
/// rendered as 0%: callers have to decide what to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberRate {
    Undefined,
    Rate { attended: u32, expected: u32 },
}

impl MemberRate {
    pub fn from_counts(attended: u32, expected: u32) -> Self {
        if expected == 0 {
            MemberRate::Undefined
        } else {
            MemberRate::Rate {
                attended: attended.min(expected),
                expected,
            }
        }
    }

    /// The rate as a fraction in [0, 1], `None` when undefined.
    pub fn value(&self) -> Option<f64> {
        match self {
            MemberRate::Undefined => None,
            MemberRate::Rate { attended, expected } => {
                Some(f64::from(*attended) / f64::from(*expected))
            }
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, MemberRate::Undefined)
    }
}

impl fmt::Display for MemberRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{:.1}%", v * 100.0),
            None => f.write_str("n/a"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Rate(MemberRate),
    Count(u32),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Rate(rate) => rate.fmt(f),
            MetricValue::Count(n) => write!(f, "{}", n),
        }
    }
}

/// Which snapshot a metric was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricInputs {
    pub snapshot_version: u64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetric {
    pub name: String,
    pub member_id: Option<String>,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub value: MetricValue,
    pub computed_from: MetricInputs,
}

impl AggregateMetric {
    /// True when the data has moved on since this metric was computed.
    pub fn is_outdated(&self, current_version: u64) -> bool {
        self.computed_from.snapshot_version < current_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_exact_fraction() {
        let rate = MemberRate::from_counts(3, 4);
        assert_eq!(rate.value(), Some(0.75));
        assert_eq!(rate.to_string(), "75.0%");
    }

    #[test]
    fn test_rate_undefined_without_services() {
        let rate = MemberRate::from_counts(0, 0);
        assert!(rate.is_undefined());
        assert_eq!(rate.value(), None);
        assert_eq!(rate.to_string(), "n/a");
    }

    #[test]
    fn test_rate_serializes_with_kind_tag() {
        let json = serde_json::to_string(&MemberRate::Undefined).unwrap();
        assert_eq!(json, r#"{"kind":"undefined"}"#);
    }
}
