//! In-memory cache of the remote attendance data.
//!
//! `LocalCache` holds the current `Snapshot` of both worksheets and refreshes
//! it through the `RemoteStore` once it is older than the freshness window
//! (five minutes by default). Snapshots are immutable and swapped whole.

pub mod local;
pub mod snapshot;

pub use local::{LocalCache, RefreshFailure};
pub use snapshot::Snapshot;
