//! Validation and last-writer-wins merging of submitted attendance.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::Snapshot;
use crate::models::AttendanceRecord;
use crate::sheets::RemoteError;
use crate::sync::{SyncCoordinator, SyncOutcome, WriteOutcome};

/// Why a submission was refused. Nothing is written for a rejected record.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("Unknown or inactive member")]
    UnknownMember,

    #[error("Event date is too far in the future")]
    InvalidDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationResult {
    Accepted,
    /// An existing record for the same key is at least as new. Not an error.
    SupersededDuplicate,
    Rejected(RejectReason),
}

pub struct Reconciler {
    sync: Arc<SyncCoordinator>,
    future_tolerance_days: i64,
}

impl Reconciler {
    pub fn new(sync: Arc<SyncCoordinator>, future_tolerance_days: i64) -> Self {
        Self {
            sync,
            future_tolerance_days,
        }
    }

    pub fn validate(
        &self,
        record: &AttendanceRecord,
        snapshot: &Snapshot,
        today: NaiveDate,
    ) -> Result<(), RejectReason> {
        if !snapshot.is_active_member(&record.member_id) {
            return Err(RejectReason::UnknownMember);
        }
        // A tolerance too large to represent means no limit.
        let latest = chrono::TimeDelta::try_days(self.future_tolerance_days)
            .and_then(|tolerance| today.checked_add_signed(tolerance));
        if latest.is_some_and(|latest| record.date > latest) {
            return Err(RejectReason::InvalidDate);
        }
        Ok(())
    }

    /// Last-writer-wins against whatever is already held for the key.
    pub fn decide(existing: Option<&AttendanceRecord>, incoming: &AttendanceRecord) -> ReconciliationResult {
        match existing {
            Some(existing) if !incoming.supersedes(existing) => ReconciliationResult::SupersededDuplicate,
            _ => ReconciliationResult::Accepted,
        }
    }

    /// The snapshot decisions are made against. Falls back to the last good
    /// snapshot when a refresh fails.
    async fn snapshot(&self) -> Result<Arc<Snapshot>, RemoteError> {
        let cache = self.sync.cache();
        let outcome = self.sync.ensure_fresh(cache.freshness()).await;
        match cache.last_good().await {
            Some(snapshot) => Ok(snapshot),
            None => Err(match outcome {
                SyncOutcome::Failed(err) => err,
                _ => RemoteError::Unavailable("no attendance data loaded".to_string()),
            }),
        }
    }

    /// Validate, merge and persist one record. The key lock is held from the
    /// decision through the write.
    ///
    /// Errors only when no snapshot can be obtained at all or the remote
    /// store fails with a non-transient error.
    pub async fn submit(&self, record: AttendanceRecord) -> Result<ReconciliationResult, RemoteError> {
        let key = record.key();
        let _guard = self.sync.lock_key(&key).await;

        let snapshot = self.snapshot().await?;
        if let Err(reason) = self.validate(&record, &snapshot, self.sync.clock().today()) {
            debug!(%key, %reason, "Submission rejected");
            return Ok(ReconciliationResult::Rejected(reason));
        }

        let existing = self
            .sync
            .pending_record(&key)
            .or_else(|| snapshot.record(&key).cloned());
        if Self::decide(existing.as_ref(), &record) == ReconciliationResult::SupersededDuplicate {
            debug!(%key, "Existing record is at least as new");
            return Ok(ReconciliationResult::SupersededDuplicate);
        }

        match self.sync.write(record).await? {
            WriteOutcome::Persisted(_) | WriteOutcome::Queued => Ok(ReconciliationResult::Accepted),
            WriteOutcome::Conflict { .. } => Ok(ReconciliationResult::SupersededDuplicate),
        }
    }
}
