//! Data models for rollsheet entities.
//!
//! - `Member`: a congregation member, never deleted, only deactivated
//! - `AttendanceRecord`, `RecordKey`, `Source`: one row of attendance per member per date
//! - `AggregateMetric`, `MemberRate`, `MetricValue`: derived values for dashboards and reports

pub mod attendance;
pub mod member;
pub mod metric;

pub use attendance::{AttendanceRecord, RecordKey, Source};
pub use member::Member;
pub use metric::{AggregateMetric, MemberRate, MetricInputs, MetricValue};
