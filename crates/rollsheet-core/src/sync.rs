//! Refresh and flush orchestration.
//!
//! The coordinator is the only component that talks to the remote store on
//! behalf of the service. It keeps the `SyncState`, decides when to go remote,
//! and queues writes locally while the remote store is degraded.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::models::{AttendanceRecord, Member, RecordKey};
use crate::sheets::{RemoteError, RemoteStore, WriteConfirmation};

/// Queued writes flushed concurrently
const FLUSH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub last_read_at: Option<DateTime<Utc>>,
    pub last_write_at: Option<DateTime<Utc>>,
    /// Local writes not yet confirmed by the remote store.
    pub pending: usize,
    /// Consecutive remote failures since the last success.
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl SyncState {
    pub fn is_degraded(&self) -> bool {
        self.phase == SyncPhase::Degraded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The cached snapshot was young enough.
    Fresh,
    Refreshed,
    /// No fresh data; readers fall back to the last good snapshot.
    Failed(RemoteError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Persisted(WriteConfirmation),
    /// Held locally until a flush succeeds.
    Queued,
    /// The remote row was recorded at or after this write.
    Conflict { remote_recorded_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Persisted(WriteConfirmation),
    /// The remote store already holds a record at least as new.
    Superseded,
    StillPending(RemoteError),
    /// Not attempted: degraded and the retry interval has not elapsed.
    Deferred,
}

/// Per-key async locks. Entries nobody holds are pruned on the next lock.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub async fn lock(&self, key: &RecordKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Take the lock for `key` only if nobody holds it.
    pub fn try_lock(&self, key: &RecordKey) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.try_lock_owned().ok()
    }
}

struct Inner {
    state: SyncState,
    last_attempt_at: Option<DateTime<Utc>>,
    last_failure: Option<RemoteError>,
}

enum RemoteOp {
    Read,
    Write,
    /// The store answered without a refresh or a persisted write.
    Answered,
}

/// How a flush pass treats keys another caller is working on.
#[derive(Clone, Copy)]
enum KeyWait {
    Wait,
    Skip,
}

pub struct SyncCoordinator {
    store: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    clock: Arc<dyn Clock>,
    degraded_threshold: u32,
    degraded_retry: Duration,
    inner: Mutex<Inner>,
    pending: Mutex<BTreeMap<RecordKey, AttendanceRecord>>,
    locks: KeyLocks,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            degraded_threshold: config.degraded_threshold.max(1),
            degraded_retry: config.degraded_retry(),
            inner: Mutex::new(Inner {
                state: SyncState::default(),
                last_attempt_at: None,
                last_failure: None,
            }),
            pending: Mutex::new(BTreeMap::new()),
            locks: KeyLocks::default(),
        }
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Lock serializing decisions and writes for one record key.
    pub async fn lock_key(&self, key: &RecordKey) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_map(&self) -> MutexGuard<'_, BTreeMap<RecordKey, AttendanceRecord>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SyncState {
        let mut state = self.inner().state.clone();
        state.pending = self.pending_map().len();
        state
    }

    /// Queued records in key order.
    pub fn pending(&self) -> Vec<AttendanceRecord> {
        self.pending_map().values().cloned().collect()
    }

    pub fn pending_record(&self, key: &RecordKey) -> Option<AttendanceRecord> {
        self.pending_map().get(key).cloned()
    }

    /// Whether a remote attempt is allowed now. Always true unless degraded.
    fn attempt_allowed(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner();
        if !inner.state.is_degraded() {
            return true;
        }
        match inner.last_attempt_at {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.degraded_retry),
        }
    }

    fn begin_attempt(&self, now: DateTime<Utc>) {
        let mut inner = self.inner();
        inner.last_attempt_at = Some(now);
        if inner.state.phase == SyncPhase::Idle {
            inner.state.phase = SyncPhase::Syncing;
        }
    }

    /// Undo `begin_attempt` when no remote call was made.
    fn end_without_remote(&self) {
        let mut inner = self.inner();
        if inner.state.phase == SyncPhase::Syncing {
            inner.state.phase = SyncPhase::Idle;
        }
    }

    fn record_success(&self, op: RemoteOp) {
        let now = self.clock.now();
        let mut inner = self.inner();
        if inner.state.is_degraded() {
            info!("Remote store reachable again, leaving degraded mode");
        }
        inner.state.phase = SyncPhase::Idle;
        inner.state.error_count = 0;
        inner.state.last_error = None;
        inner.last_failure = None;
        match op {
            RemoteOp::Read => inner.state.last_read_at = Some(now),
            RemoteOp::Write => inner.state.last_write_at = Some(now),
            RemoteOp::Answered => {}
        }
    }

    fn record_failure(&self, err: &RemoteError) {
        let mut inner = self.inner();
        inner.state.error_count = inner.state.error_count.saturating_add(1);
        inner.state.last_error = Some(err.to_string());
        inner.last_failure = Some(err.clone());
        if inner.state.error_count >= self.degraded_threshold {
            if !inner.state.is_degraded() {
                warn!(
                    errors = inner.state.error_count,
                    error = %err,
                    "Entering degraded mode"
                );
            }
            inner.state.phase = SyncPhase::Degraded;
        } else {
            inner.state.phase = SyncPhase::Idle;
        }
    }

    fn degraded_error(&self) -> RemoteError {
        self.inner()
            .last_failure
            .clone()
            .unwrap_or_else(|| RemoteError::Unavailable("remote store degraded".to_string()))
    }

    /// Make sure the cache holds a snapshot no older than `max_age`.
    pub async fn ensure_fresh(&self, max_age: Duration) -> SyncOutcome {
        self.refresh(max_age, false).await
    }

    /// Refresh from the remote store now, ignoring the degraded retry interval.
    pub async fn refresh_now(&self) -> SyncOutcome {
        self.cache.invalidate();
        self.refresh(Duration::ZERO, true).await
    }

    async fn refresh(&self, max_age: Duration, force: bool) -> SyncOutcome {
        let now = self.clock.now();
        if !force && !self.attempt_allowed(now) {
            debug!("Degraded, skipping refresh until retry interval elapses");
            return SyncOutcome::Failed(self.degraded_error());
        }

        self.begin_attempt(now);
        match self.cache.get_within(now, max_age).await {
            Ok((_, false)) => {
                self.end_without_remote();
                SyncOutcome::Fresh
            }
            Ok((_, true)) => {
                self.record_success(RemoteOp::Read);
                self.drain_pending().await;
                // Whatever is still queued is not in the remote data yet.
                for record in self.pending() {
                    self.cache.apply(record).await;
                }
                SyncOutcome::Refreshed
            }
            Err(failure) => {
                if failure.attempted {
                    self.record_failure(&failure.error);
                } else {
                    // Another caller's refresh failed and already counted it.
                    self.end_without_remote();
                }
                SyncOutcome::Failed(failure.error)
            }
        }
    }

    fn enqueue(&self, record: AttendanceRecord) {
        let mut pending = self.pending_map();
        let key = record.key();
        match pending.get(&key) {
            Some(existing) if !record.supersedes(existing) => {}
            _ => {
                debug!(%key, "Write queued");
                pending.insert(key, record);
            }
        }
    }

    /// Drop the queued entry for `record`'s key unless a newer one replaced it.
    fn dequeue(&self, record: &AttendanceRecord) {
        let mut pending = self.pending_map();
        let key = record.key();
        if pending.get(&key).is_some_and(|queued| !queued.supersedes(record)) {
            pending.remove(&key);
        }
    }

    /// Persist `record`, or queue it when the remote store is unreachable.
    /// The caller holds the key lock. Non-transient failures other than a
    /// conflict are returned as errors.
    pub async fn write(&self, record: AttendanceRecord) -> Result<WriteOutcome, RemoteError> {
        let now = self.clock.now();
        if !self.attempt_allowed(now) {
            self.enqueue(record.clone());
            self.cache.apply(record).await;
            return Ok(WriteOutcome::Queued);
        }

        self.begin_attempt(now);
        match self.store.append_or_update(&record).await {
            Ok(confirmation) => {
                self.record_success(RemoteOp::Write);
                self.dequeue(&record);
                self.cache.apply(record).await;
                self.drain_pending().await;
                Ok(WriteOutcome::Persisted(confirmation))
            }
            Err(RemoteError::Conflict {
                key,
                remote_recorded_at,
            }) => {
                self.record_success(RemoteOp::Answered);
                debug!(%key, %remote_recorded_at, "Remote holds a newer record");
                self.cache.invalidate();
                Ok(WriteOutcome::Conflict { remote_recorded_at })
            }
            Err(err) if err.is_transient() => {
                warn!(key = %record.key(), error = %err, "Write failed, queued for later");
                self.record_failure(&err);
                self.enqueue(record.clone());
                self.cache.apply(record).await;
                Ok(WriteOutcome::Queued)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Upsert a member row. Member changes are never queued.
    pub async fn write_member(&self, member: Member) -> Result<WriteConfirmation, RemoteError> {
        let now = self.clock.now();
        if !self.attempt_allowed(now) {
            return Err(self.degraded_error());
        }
        self.begin_attempt(now);
        match self.store.upsert_member(&member).await {
            Ok(confirmation) => {
                self.record_success(RemoteOp::Write);
                self.cache.apply_member(member).await;
                Ok(confirmation)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Flush queued writes. While degraded this is a no-op until the retry
    /// interval has elapsed, reporting every record as `Deferred`.
    pub async fn flush_pending(&self) -> Vec<(AttendanceRecord, FlushOutcome)> {
        let queued = self.pending();
        if queued.is_empty() {
            return Vec::new();
        }
        if !self.attempt_allowed(self.clock.now()) {
            debug!(pending = queued.len(), "Degraded, flush deferred");
            return queued
                .into_iter()
                .map(|record| (record, FlushOutcome::Deferred))
                .collect();
        }
        self.flush(queued, KeyWait::Wait).await
    }

    /// Flush queued writes regardless of the degraded retry interval.
    pub async fn force_flush(&self) -> Vec<(AttendanceRecord, FlushOutcome)> {
        let queued = self.pending();
        if queued.is_empty() {
            return Vec::new();
        }
        self.flush(queued, KeyWait::Wait).await
    }

    /// Flush after the remote store answered a read or a write. Keys locked
    /// by another caller are left queued; that caller may be the one that
    /// triggered this drain.
    async fn drain_pending(&self) {
        let queued = self.pending();
        if queued.is_empty() || !self.attempt_allowed(self.clock.now()) {
            return;
        }
        let results = self.flush(queued, KeyWait::Skip).await;
        let persisted = results
            .iter()
            .filter(|(_, outcome)| matches!(outcome, FlushOutcome::Persisted(_)))
            .count();
        info!(
            persisted,
            remaining = self.pending_map().len(),
            "Drained queued writes"
        );
    }

    async fn flush(
        &self,
        queued: Vec<AttendanceRecord>,
        wait: KeyWait,
    ) -> Vec<(AttendanceRecord, FlushOutcome)> {
        info!(pending = queued.len(), "Flushing queued writes");
        self.begin_attempt(self.clock.now());

        let mut results: Vec<(AttendanceRecord, FlushOutcome)> = stream::iter(queued)
            .map(|record| self.flush_one(record.key(), wait))
            .buffer_unordered(FLUSH_CONCURRENCY)
            .filter_map(|result| async move { result })
            .collect()
            .await;

        // One pass is one look at the store, so it counts at most one failure.
        let reached = results.iter().any(|(_, outcome)| {
            matches!(
                outcome,
                FlushOutcome::Persisted(_) | FlushOutcome::Superseded
            )
        });
        let failure = results.iter().find_map(|(_, outcome)| match outcome {
            FlushOutcome::StillPending(err) => Some(err.clone()),
            _ => None,
        });
        if !reached {
            if let Some(err) = failure {
                self.record_failure(&err);
            }
        }
        self.end_without_remote();

        results.sort_by(|(a, _), (b, _)| a.key().cmp(&b.key()));
        results
    }

    /// Flush the record queued for `key`, if it is still queued once the key
    /// lock is held. `None` when there was nothing to do.
    async fn flush_one(
        &self,
        key: RecordKey,
        wait: KeyWait,
    ) -> Option<(AttendanceRecord, FlushOutcome)> {
        let _guard = match wait {
            KeyWait::Wait => self.locks.lock(&key).await,
            KeyWait::Skip => self.locks.try_lock(&key)?,
        };
        let record = self.pending_record(&key)?;
        let outcome = match self.store.append_or_update(&record).await {
            Ok(confirmation) => {
                self.record_success(RemoteOp::Write);
                self.dequeue(&record);
                self.cache.apply(record.clone()).await;
                FlushOutcome::Persisted(confirmation)
            }
            Err(RemoteError::Conflict { key, .. }) => {
                self.record_success(RemoteOp::Answered);
                debug!(%key, "Queued write superseded remotely");
                self.dequeue(&record);
                self.cache.invalidate();
                FlushOutcome::Superseded
            }
            Err(err) => FlushOutcome::StillPending(err),
        };
        Some((record, outcome))
    }
}
