//! Core library for rollsheet.
//!
//! Rollsheet records church attendance in a remote spreadsheet and derives
//! dashboard and report metrics from it. This crate contains everything
//! except the presentation layer:
//!
//! - `sheets`: translation to/from worksheet rows, HTTP transport, retry policy
//! - `cache`: in-memory snapshot of the remote data with a freshness window
//! - `reconcile`: validation and last-writer-wins merging of submissions
//! - `aggregate`: attendance rates, per-date totals and trends
//! - `schedule`: which dates services are held on
//! - `sync`: refresh/flush orchestration and degraded-mode handling
//! - `service`: the consumer-facing API tying it all together

pub mod aggregate;
pub mod cache;
pub mod clock;
pub mod config;
pub mod models;
pub mod reconcile;
pub mod schedule;
pub mod service;
pub mod sheets;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use models::{AggregateMetric, AttendanceRecord, Member, MemberRate, RecordKey, Source};
pub use reconcile::{ReconciliationResult, RejectReason};
pub use service::{AttendanceService, DashboardSnapshot, ServiceError};
pub use sheets::{RemoteError, RemoteStore};
pub use sync::{SyncOutcome, SyncPhase, SyncState};
