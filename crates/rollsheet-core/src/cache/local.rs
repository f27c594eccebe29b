use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::Snapshot;
use crate::clock::Clock;
use crate::models::{AttendanceRecord, Member};
use crate::sheets::{RemoteError, RemoteStore};

/// A refresh that did not produce a snapshot.
#[derive(Debug, Clone)]
pub struct RefreshFailure {
    pub error: RemoteError,
    /// Whether this call went to the remote store itself, as opposed to
    /// sharing the failure of a refresh that was already in flight.
    pub attempted: bool,
}

/// In-memory mirror of the remote worksheets.
///
/// The current snapshot is swapped as a whole under a write lock, so a
/// reader sees either the old or the new snapshot, never a mix. Refreshes are
/// serialized by `refresh_gate`; callers that queue behind an in-flight
/// refresh take its result instead of reading the remote again.
pub struct LocalCache {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    current: RwLock<Option<Arc<Snapshot>>>,
    refresh_gate: Mutex<()>,
    /// Completed refresh attempts, successful or not.
    attempts: AtomicU64,
    last_failure: Mutex<Option<RemoteError>>,
    /// Bumped by `invalidate`.
    invalidations: AtomicU64,
    /// Value of `invalidations` when the current snapshot was read.
    snapshot_epoch: AtomicU64,
    versions: AtomicU64,
}

impl LocalCache {
    pub fn new(store: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>, freshness: Duration) -> Self {
        Self {
            store,
            clock,
            freshness,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            invalidations: AtomicU64::new(0),
            snapshot_epoch: AtomicU64::new(0),
            versions: AtomicU64::new(0),
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// The snapshot as of `as_of`, refreshing first if it is older than the
    /// freshness window or has been invalidated.
    pub async fn get(&self, as_of: DateTime<Utc>) -> Result<Arc<Snapshot>, RemoteError> {
        self.get_within(as_of, self.freshness)
            .await
            .map(|(snapshot, _)| snapshot)
            .map_err(|failure| failure.error)
    }

    /// Like `get` with an explicit maximum age. The flag reports whether
    /// this call performed a remote refresh.
    pub async fn get_within(
        &self,
        as_of: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<(Arc<Snapshot>, bool), RefreshFailure> {
        if let Some(snapshot) = self.fresh_snapshot(as_of, max_age).await {
            debug!(version = snapshot.version(), "Cache hit");
            return Ok((snapshot, false));
        }

        let ticket = self.attempts.load(Ordering::Acquire);
        let _gate = self.refresh_gate.lock().await;

        if self.attempts.load(Ordering::Acquire) != ticket {
            // Someone refreshed while we waited; share their outcome.
            if let Some(error) = self.last_failure.lock().await.clone() {
                return Err(RefreshFailure {
                    error,
                    attempted: false,
                });
            }
            if let Some(snapshot) = self.last_good().await {
                return Ok((snapshot, false));
            }
        }
        if let Some(snapshot) = self.fresh_snapshot(as_of, max_age).await {
            return Ok((snapshot, false));
        }

        let result = self.refresh_locked().await;
        *self.last_failure.lock().await = result.as_ref().err().cloned();
        self.attempts.fetch_add(1, Ordering::AcqRel);
        result
            .map(|snapshot| (snapshot, true))
            .map_err(|error| RefreshFailure {
                error,
                attempted: true,
            })
    }

    /// Fetch both worksheets and publish a new snapshot. Caller holds the gate.
    async fn refresh_locked(&self) -> Result<Arc<Snapshot>, RemoteError> {
        info!("Refreshing attendance cache");
        let epoch = self.invalidations.load(Ordering::Acquire);
        let (records, members) =
            tokio::try_join!(self.store.read_all(), self.store.read_members()).map_err(|err| {
                warn!(error = %err, "Cache refresh failed");
                err
            })?;

        let version = self.next_version();
        let snapshot = Arc::new(Snapshot::new(version, self.clock.now(), records, members));
        *self.current.write().await = Some(Arc::clone(&snapshot));
        // An invalidate() that landed during the read keeps the epochs apart.
        self.snapshot_epoch.store(epoch, Ordering::Release);
        info!(
            version,
            records = snapshot.len(),
            "Attendance cache refreshed"
        );
        Ok(snapshot)
    }

    async fn fresh_snapshot(&self, as_of: DateTime<Utc>, max_age: Duration) -> Option<Arc<Snapshot>> {
        if self.snapshot_epoch.load(Ordering::Acquire) != self.invalidations.load(Ordering::Acquire) {
            return None;
        }
        self.current
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_fresh_at(as_of, max_age))
            .cloned()
    }

    /// Force the next `get` to go to the remote store.
    pub fn invalidate(&self) {
        debug!("Cache invalidated");
        self.invalidations.fetch_add(1, Ordering::AcqRel);
    }

    /// The most recent snapshot regardless of age.
    pub async fn last_good(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    /// Publish a snapshot that includes `record`, if it wins last-writer-wins
    /// against what is cached. No-op before the first refresh.
    pub async fn apply(&self, record: AttendanceRecord) {
        let mut current = self.current.write().await;
        if let Some(snapshot) = current.as_ref() {
            if let Some(next) = snapshot.with_record(record, self.next_version()) {
                *current = Some(Arc::new(next));
            }
        }
    }

    pub async fn apply_member(&self, member: Member) {
        let mut current = self.current.write().await;
        if let Some(snapshot) = current.as_ref() {
            let next = snapshot.with_member(member, self.next_version());
            *current = Some(Arc::new(next));
        }
    }

    /// Human-readable age of the current snapshot, "never" before the first refresh.
    pub async fn age_display(&self) -> String {
        match self.last_good().await {
            Some(snapshot) => snapshot.age_display_at(self.clock.now()),
            None => "never".to_string(),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::AcqRel) + 1
    }
}
