//! The consumer-facing API.
//!
//! `AttendanceService` wires the store, cache, coordinator and reconciler
//! together and is what a front end calls. Reads degrade to the last good
//! snapshot, flagged `stale`, rather than failing.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::aggregate::{AggregationEngine, TrendBucket, TrendPoint};
use crate::cache::{LocalCache, Snapshot};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::models::{AggregateMetric, AttendanceRecord, Member, RecordKey, Source};
use crate::reconcile::{ReconciliationResult, Reconciler};
use crate::schedule::ServiceSchedule;
use crate::sheets::{RemoteError, RemoteStore, SheetStore, SheetsClient, WriteConfirmation};
use crate::sync::{FlushOutcome, SyncCoordinator, SyncOutcome, SyncState};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("No attendance data available: {0}")]
    Unavailable(RemoteError),

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Member already exists: {0}")]
    DuplicateMember(String),

    #[error("Invalid period: {start} is after {end}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },
}

/// Everything a dashboard page needs, computed from one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    /// Records dated inside the period, in date then member order.
    pub records: Vec<AttendanceRecord>,
    pub aggregates: Vec<AggregateMetric>,
    pub totals: BTreeMap<NaiveDate, u32>,
    pub sync_state: SyncState,
    /// The data could not be refreshed and may be out of date.
    pub stale: bool,
    pub cache_age: String,
}

/// Result of a connectivity and schema check against both worksheets.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub records: usize,
    pub members: usize,
    pub active_members: usize,
    pub pending: usize,
}

pub struct AttendanceService {
    sync: Arc<SyncCoordinator>,
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
    schedule: ServiceSchedule,
    dashboard_window_days: u32,
}

impl AttendanceService {
    pub fn new(store: Arc<dyn RemoteStore>, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let cache = Arc::new(LocalCache::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.sync.freshness_window(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            store,
            cache,
            Arc::clone(&clock),
            &config.sync,
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&sync),
            config.validation.future_date_tolerance_days,
        );
        Self {
            sync,
            reconciler,
            clock,
            schedule: ServiceSchedule::from_config(&config.schedule),
            dashboard_window_days: config.schedule.dashboard_window_days.max(1),
        }
    }

    /// Service over the spreadsheet REST API with the wall clock.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client = SheetsClient::from_config(config)?;
        let store = SheetStore::from_config(client, config);
        Ok(Self::new(Arc::new(store), config, Arc::new(SystemClock)))
    }

    pub fn schedule(&self) -> &ServiceSchedule {
        &self.schedule
    }

    /// Current snapshot and whether it is stale. Refreshes when older than
    /// the freshness window; falls back to the last good snapshot.
    async fn read_snapshot(&self) -> Result<(Arc<Snapshot>, bool), ServiceError> {
        let cache = self.sync.cache();
        let outcome = self.sync.ensure_fresh(cache.freshness()).await;
        let last_good = cache.last_good().await;
        match (outcome, last_good) {
            (SyncOutcome::Failed(err), Some(snapshot)) => {
                debug!(error = %err, "Serving stale snapshot");
                Ok((snapshot, true))
            }
            (SyncOutcome::Failed(err), None) => Err(ServiceError::Unavailable(err)),
            (_, Some(snapshot)) => Ok((snapshot, false)),
            (_, None) => Err(ServiceError::Unavailable(RemoteError::Unavailable(
                "no attendance data loaded".to_string(),
            ))),
        }
    }

    fn check_period(start: NaiveDate, end: NaiveDate) -> Result<(), ServiceError> {
        if start > end {
            return Err(ServiceError::InvalidPeriod { start, end });
        }
        Ok(())
    }

    /// Record attendance for a member on a date, stamped with the current time.
    pub async fn submit_attendance(
        &self,
        member_id: &str,
        date: NaiveDate,
        present: bool,
    ) -> Result<ReconciliationResult, ServiceError> {
        let record = AttendanceRecord::new(member_id, date, present, self.clock.now());
        self.submit(record).await
    }

    pub async fn submit(&self, record: AttendanceRecord) -> Result<ReconciliationResult, ServiceError> {
        let key = record.key();
        let result = self.reconciler.submit(record).await?;
        info!(%key, ?result, "Attendance submitted");
        Ok(result)
    }

    /// Submit records from a bulk source. Each is marked as imported and
    /// reconciled on its own; one rejection does not stop the rest.
    pub async fn import_records(
        &self,
        records: Vec<AttendanceRecord>,
    ) -> Result<Vec<(RecordKey, ReconciliationResult)>, ServiceError> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let record = record.with_source(Source::Import);
            let key = record.key();
            let result = self.reconciler.submit(record).await?;
            results.push((key, result));
        }
        info!(count = results.len(), "Import finished");
        Ok(results)
    }

    /// Dashboard for the configured window ending on `as_of`.
    pub async fn dashboard_snapshot(&self, as_of: NaiveDate) -> Result<DashboardSnapshot, ServiceError> {
        let (snapshot, stale) = self.read_snapshot().await?;
        let period_start = chrono::TimeDelta::try_days(i64::from(self.dashboard_window_days) - 1)
            .and_then(|window| as_of.checked_sub_signed(window))
            .unwrap_or(NaiveDate::MIN);
        let engine = AggregationEngine::new(&snapshot, &self.schedule);

        Ok(DashboardSnapshot {
            period_start,
            period_end: as_of,
            records: snapshot
                .records()
                .filter(|r| r.date >= period_start && r.date <= as_of)
                .cloned()
                .collect(),
            aggregates: engine.dashboard_metrics(period_start, as_of),
            totals: engine.period_totals(period_start, as_of),
            sync_state: self.sync.state(),
            stale,
            cache_age: snapshot.age_display_at(self.clock.now()),
        })
    }

    pub async fn member_report(
        &self,
        member_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AggregateMetric>, ServiceError> {
        Self::check_period(start, end)?;
        let (snapshot, _) = self.read_snapshot().await?;
        if snapshot.member(member_id).is_none() {
            return Err(ServiceError::UnknownMember(member_id.to_string()));
        }
        Ok(AggregationEngine::new(&snapshot, &self.schedule).member_report(member_id, start, end))
    }

    pub async fn trend(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        bucket: TrendBucket,
    ) -> Result<Vec<TrendPoint>, ServiceError> {
        Self::check_period(start, end)?;
        let (snapshot, _) = self.read_snapshot().await?;
        Ok(AggregationEngine::new(&snapshot, &self.schedule).trend(start, end, bucket))
    }

    pub async fn group_totals(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<String, u32>, ServiceError> {
        Self::check_period(start, end)?;
        let (snapshot, _) = self.read_snapshot().await?;
        Ok(AggregationEngine::new(&snapshot, &self.schedule).group_totals(start, end))
    }

    /// All members, inactive ones included, ordered by id.
    pub async fn members(&self) -> Result<Vec<Member>, ServiceError> {
        let (snapshot, _) = self.read_snapshot().await?;
        Ok(snapshot.members().cloned().collect())
    }

    async fn existing_member(&self, member_id: &str) -> Result<Member, ServiceError> {
        let (snapshot, _) = self.read_snapshot().await?;
        snapshot
            .member(member_id)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownMember(member_id.to_string()))
    }

    pub async fn add_member(&self, member: Member) -> Result<WriteConfirmation, ServiceError> {
        let (snapshot, _) = self.read_snapshot().await?;
        if snapshot.member(&member.member_id).is_some() {
            return Err(ServiceError::DuplicateMember(member.member_id));
        }
        Ok(self.sync.write_member(member).await?)
    }

    pub async fn rename_member(&self, member_id: &str, display_name: &str) -> Result<WriteConfirmation, ServiceError> {
        let mut member = self.existing_member(member_id).await?;
        member.display_name = display_name.to_string();
        Ok(self.sync.write_member(member).await?)
    }

    /// Move a member to `group`, or out of any group with `None`.
    pub async fn regroup_member(
        &self,
        member_id: &str,
        group: Option<String>,
    ) -> Result<WriteConfirmation, ServiceError> {
        let mut member = self.existing_member(member_id).await?;
        member.group = group;
        Ok(self.sync.write_member(member).await?)
    }

    /// Members are never deleted. A deactivated member keeps their history
    /// but new submissions for them are rejected.
    pub async fn deactivate_member(&self, member_id: &str) -> Result<WriteConfirmation, ServiceError> {
        let mut member = self.existing_member(member_id).await?;
        member.active = false;
        Ok(self.sync.write_member(member).await?)
    }

    /// Try to persist queued writes. Honors the degraded retry interval.
    pub async fn flush_pending(&self) -> Vec<(AttendanceRecord, FlushOutcome)> {
        self.sync.flush_pending().await
    }

    /// Persist queued writes now, ignoring the degraded retry interval.
    /// Short-lived callers use this before exiting, since the queue is
    /// held in memory only.
    pub async fn force_flush(&self) -> Vec<(AttendanceRecord, FlushOutcome)> {
        self.sync.force_flush().await
    }

    pub fn pending(&self) -> Vec<AttendanceRecord> {
        self.sync.pending()
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    /// Read both worksheets now, bypassing the cache and the degraded
    /// retry interval.
    pub async fn check(&self) -> Result<CheckReport, ServiceError> {
        if let SyncOutcome::Failed(err) = self.sync.refresh_now().await {
            return Err(ServiceError::Remote(err));
        }
        let (snapshot, _) = self.read_snapshot().await?;
        Ok(CheckReport {
            records: snapshot.len(),
            members: snapshot.members().count(),
            active_members: snapshot.members().filter(|m| m.active).count(),
            pending: self.sync.state().pending,
        })
    }
}
