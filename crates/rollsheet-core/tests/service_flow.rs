//! End-to-end flows through `AttendanceService` against the in-memory worksheet.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rollsheet_core::sheets::schema::{header_row, member_to_row, record_from_row, MEMBERS_HEADER};
use rollsheet_core::sheets::{MemorySheet, RetryPolicy, SheetStore};
use rollsheet_core::sync::FlushOutcome;
use rollsheet_core::{
    AttendanceService, Config, ManualClock, Member, ReconciliationResult, RemoteError, SyncPhase,
};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn setup() -> (Arc<MemorySheet>, Arc<ManualClock>, AttendanceService) {
    let sheet = Arc::new(MemorySheet::with_headers("attendance", "members"));
    sheet.set_rows(
        "members",
        vec![
            header_row(&MEMBERS_HEADER),
            member_to_row(&Member::new("ruth", "Ruth").with_group("Choir")),
            member_to_row(&Member::new("ade", "Ade")),
        ],
    );
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap()));
    let store = SheetStore::new(Arc::clone(&sheet)).with_retry(RetryPolicy::no_retry());
    let service = AttendanceService::new(Arc::new(store), &Config::default(), clock.clone());
    (sheet, clock, service)
}

#[tokio::test]
async fn test_resubmission_keeps_single_row() {
    let (sheet, clock, service) = setup();

    let first = service.submit_attendance("ruth", date(10), true).await.unwrap();
    assert_eq!(first, ReconciliationResult::Accepted);

    // A correction later in the day replaces the row in place.
    clock.advance(Duration::minutes(5));
    let second = service.submit_attendance("ruth", date(10), false).await.unwrap();
    assert_eq!(second, ReconciliationResult::Accepted);

    let rows = sheet.rows("attendance");
    assert_eq!(rows.len(), 2);
    assert!(!record_from_row(&rows[1]).unwrap().present);
}

#[tokio::test]
async fn test_outage_queues_then_recovers() {
    let (sheet, clock, service) = setup();
    service.dashboard_snapshot(date(10)).await.unwrap();

    sheet.fail_next(1000, RemoteError::Unavailable("connection reset".into()));
    for _ in 0..3 {
        clock.advance(Duration::minutes(6));
        let dash = service.dashboard_snapshot(date(10)).await.unwrap();
        assert!(dash.stale);
    }
    assert_eq!(service.sync_state().phase, SyncPhase::Degraded);

    // Submissions during the outage are accepted and held locally.
    let result = service.submit_attendance("ade", date(10), true).await.unwrap();
    assert_eq!(result, ReconciliationResult::Accepted);
    assert_eq!(service.pending().len(), 1);
    let dash = service.dashboard_snapshot(date(10)).await.unwrap();
    assert!(dash.stale);
    assert!(dash.records.iter().any(|r| r.member_id == "ade"));

    sheet.clear_faults();
    clock.advance(Duration::minutes(15));
    let flushed = service.flush_pending().await;
    assert_eq!(flushed.len(), 1);
    assert!(matches!(flushed[0].1, FlushOutcome::Persisted(_)));

    let state = service.sync_state();
    assert_eq!(state.phase, SyncPhase::Idle);
    assert_eq!(state.pending, 0);
    assert_eq!(sheet.rows("attendance").len(), 2);

    let dash = service.dashboard_snapshot(date(10)).await.unwrap();
    assert!(!dash.stale);
}

#[tokio::test]
async fn test_queued_writes_drain_on_next_read_after_recovery() {
    let (sheet, clock, service) = setup();
    service.dashboard_snapshot(date(10)).await.unwrap();

    sheet.fail_next(1000, RemoteError::Unavailable("connection reset".into()));
    for _ in 0..3 {
        clock.advance(Duration::minutes(6));
        service.dashboard_snapshot(date(10)).await.unwrap();
    }
    service.submit_attendance("ade", date(10), true).await.unwrap();
    service.submit_attendance("ruth", date(10), false).await.unwrap();
    assert_eq!(service.pending().len(), 2);

    // No flush call: the first successful refresh sends the queue.
    sheet.clear_faults();
    clock.advance(Duration::minutes(15));
    let dash = service.dashboard_snapshot(date(10)).await.unwrap();
    assert!(!dash.stale);
    assert_eq!(dash.records.len(), 2);
    assert!(service.pending().is_empty());
    assert_eq!(sheet.rows("attendance").len(), 3);
}

#[tokio::test]
async fn test_schema_drift_is_reported() {
    let (sheet, _, service) = setup();
    sheet.set_rows(
        "attendance",
        vec![vec!["date".into(), "member_id".into(), "present".into()]],
    );
    let err = service.check().await.unwrap_err();
    assert!(err.to_string().contains("schema mismatch"));
}
