//! Domain-level access to the attendance and members worksheets.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::schema::{
    self, member_from_row, member_to_row, record_from_row, record_to_row, ATTENDANCE_HEADER,
    MEMBERS_HEADER,
};
use super::{RemoteError, RetryPolicy, SheetTransport};
use crate::config::Config;
use crate::models::{AttendanceRecord, Member, RecordKey};

/// What a successful keyed write did to the worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConfirmation {
    Appended,
    Updated,
    /// The row already held exactly this value, e.g. after a retried write
    /// whose first attempt landed.
    Unchanged,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every attendance record, one per key, ordered by date then member.
    async fn read_all(&self) -> Result<Vec<AttendanceRecord>, RemoteError>;

    /// Keyed upsert. Fails with `Conflict` if the remote row for the key was
    /// recorded at or after this record and differs from it.
    async fn append_or_update(&self, record: &AttendanceRecord) -> Result<WriteConfirmation, RemoteError>;

    async fn read_members(&self) -> Result<Vec<Member>, RemoteError>;

    async fn upsert_member(&self, member: &Member) -> Result<WriteConfirmation, RemoteError>;
}

/// `RemoteStore` over worksheet rows.
///
/// Every transport call runs under `timeout`; each operation runs under the
/// retry policy. Writes re-read the sheet and locate their row by key on
/// every attempt, so a retry after an unknown outcome converges instead of
/// appending twice.
pub struct SheetStore<T> {
    transport: T,
    attendance_sheet: String,
    members_sheet: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<T: SheetTransport> SheetStore<T> {
    pub fn new(transport: T) -> Self {
        let config = Config::default();
        Self::from_config(transport, &config)
    }

    pub fn from_config(transport: T, config: &Config) -> Self {
        Self {
            transport,
            attendance_sheet: config.sheets.attendance_sheet.clone(),
            members_sheet: config.sheets.members_sheet.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            timeout: config.sync.request_timeout(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run a transport call under the timeout. `None` means it timed out.
    async fn timed<R>(&self, call: impl Future<Output = Result<R, RemoteError>>) -> Option<Result<R, RemoteError>> {
        tokio::time::timeout(self.timeout, call).await.ok()
    }

    async fn read_sheet<R>(
        &self,
        sheet: &str,
        header: &[&str],
        parse: fn(&[String]) -> Result<R, String>,
    ) -> Result<Vec<(usize, R)>, RemoteError> {
        let rows = self
            .timed(self.transport.read_rows(sheet))
            .await
            .unwrap_or_else(|| {
                Err(RemoteError::Unavailable(format!(
                    "Reading {} timed out after {:?}",
                    sheet, self.timeout
                )))
            })?;
        let data = schema::split_table(sheet, header, rows)?;
        schema::parse_rows(sheet, data, parse)
    }

    /// Attendance rows collapsed to one per key: the latest `recorded_at`
    /// wins, and on a tie the lower row.
    async fn load_attendance(&self) -> Result<BTreeMap<RecordKey, (usize, AttendanceRecord)>, RemoteError> {
        let rows = self
            .read_sheet(&self.attendance_sheet, &ATTENDANCE_HEADER, record_from_row)
            .await?;
        let mut by_key: BTreeMap<RecordKey, (usize, AttendanceRecord)> = BTreeMap::new();
        for (index, record) in rows {
            let key = record.key();
            match by_key.get(&key) {
                Some((_, existing)) if existing.supersedes(&record) => {
                    debug!(%key, row = index + 1, "Ignoring older duplicate row");
                }
                Some(_) => {
                    debug!(%key, row = index + 1, "Duplicate row supersedes earlier one");
                    by_key.insert(key, (index, record));
                }
                None => {
                    by_key.insert(key, (index, record));
                }
            }
        }
        Ok(by_key)
    }

    /// Write a row (append when `index` is None) under the timeout.
    /// A timeout means the outcome is unknown.
    async fn write_row(&self, sheet: &str, index: Option<usize>, row: schema::Row) -> Result<(), RemoteError> {
        let call = async {
            match index {
                Some(index) => self.transport.update_row(sheet, index, row).await,
                None => self.transport.append_row(sheet, row).await,
            }
        };
        match self.timed(call).await {
            Some(result) => result,
            None => {
                warn!(sheet, "Write timed out, outcome unknown; will re-read before retrying");
                Err(RemoteError::Unavailable(format!(
                    "Write to {} timed out after {:?}, outcome unknown",
                    sheet, self.timeout
                )))
            }
        }
    }

    async fn upsert_record_once(&self, record: &AttendanceRecord) -> Result<WriteConfirmation, RemoteError> {
        let key = record.key();
        let existing = self.load_attendance().await?.remove(&key);
        let row = record_to_row(record);

        match existing {
            Some((_, current)) if current == *record => {
                debug!(%key, "Remote row already matches");
                Ok(WriteConfirmation::Unchanged)
            }
            Some((_, current)) if !record.supersedes(&current) => Err(RemoteError::Conflict {
                key,
                remote_recorded_at: current.recorded_at,
            }),
            Some((index, _)) => {
                self.write_row(&self.attendance_sheet, Some(index), row).await?;
                Ok(WriteConfirmation::Updated)
            }
            None => {
                self.write_row(&self.attendance_sheet, None, row).await?;
                Ok(WriteConfirmation::Appended)
            }
        }
    }

    async fn upsert_member_once(&self, member: &Member) -> Result<WriteConfirmation, RemoteError> {
        let members = self
            .read_sheet(&self.members_sheet, &MEMBERS_HEADER, member_from_row)
            .await?;
        let existing = members
            .into_iter()
            .find(|(_, m)| m.member_id == member.member_id);
        let row = member_to_row(member);

        match existing {
            Some((_, current)) if current == *member => Ok(WriteConfirmation::Unchanged),
            Some((index, _)) => {
                self.write_row(&self.members_sheet, Some(index), row).await?;
                Ok(WriteConfirmation::Updated)
            }
            None => {
                self.write_row(&self.members_sheet, None, row).await?;
                Ok(WriteConfirmation::Appended)
            }
        }
    }
}

#[async_trait]
impl<T: SheetTransport> RemoteStore for SheetStore<T> {
    async fn read_all(&self) -> Result<Vec<AttendanceRecord>, RemoteError> {
        let by_key = self
            .retry
            .run("read attendance", |_| self.load_attendance())
            .await?;
        debug!(count = by_key.len(), "Attendance loaded");
        Ok(by_key.into_values().map(|(_, record)| record).collect())
    }

    async fn append_or_update(&self, record: &AttendanceRecord) -> Result<WriteConfirmation, RemoteError> {
        let confirmation = self
            .retry
            .run("write attendance", |_| self.upsert_record_once(record))
            .await?;
        info!(key = %record.key(), ?confirmation, "Attendance written");
        Ok(confirmation)
    }

    async fn read_members(&self) -> Result<Vec<Member>, RemoteError> {
        let members = self
            .retry
            .run("read members", |_| {
                self.read_sheet(&self.members_sheet, &MEMBERS_HEADER, member_from_row)
            })
            .await?;
        Ok(members.into_iter().map(|(_, m)| m).collect())
    }

    async fn upsert_member(&self, member: &Member) -> Result<WriteConfirmation, RemoteError> {
        let confirmation = self
            .retry
            .run("write member", |_| self.upsert_member_once(member))
            .await?;
        info!(member_id = %member.member_id, ?confirmation, "Member written");
        Ok(confirmation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::schema::header_row;
    use crate::sheets::{Fault, MemorySheet};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::Arc;

    fn store(sheet: &Arc<MemorySheet>) -> SheetStore<Arc<MemorySheet>> {
        SheetStore::new(Arc::clone(sheet))
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            })
            .with_timeout(Duration::from_secs(5))
    }

    fn sheet() -> Arc<MemorySheet> {
        Arc::new(MemorySheet::with_headers("attendance", "members"))
    }

    fn record(member: &str, day: u32, hour: u32, present: bool) -> AttendanceRecord {
        AttendanceRecord::new(
            member,
            NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            present,
            Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_append_then_update_same_key() {
        let sheet = sheet();
        let store = store(&sheet);

        let first = record("m-1", 3, 9, false);
        let second = record("m-1", 3, 11, true);
        assert_eq!(store.append_or_update(&first).await, Ok(WriteConfirmation::Appended));
        assert_eq!(store.append_or_update(&second).await, Ok(WriteConfirmation::Updated));

        assert_eq!(sheet.rows("attendance").len(), 2);
        assert_eq!(store.read_all().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_same_record_twice_is_unchanged() {
        let sheet = sheet();
        let store = store(&sheet);
        let r = record("m-1", 3, 9, true);

        store.append_or_update(&r).await.unwrap();
        assert_eq!(store.append_or_update(&r).await, Ok(WriteConfirmation::Unchanged));
        assert_eq!(sheet.rows("attendance").len(), 2);
    }

    #[tokio::test]
    async fn test_older_write_conflicts() {
        let sheet = sheet();
        let store = store(&sheet);
        store.append_or_update(&record("m-1", 3, 11, true)).await.unwrap();

        let err = store
            .append_or_update(&record("m-1", 3, 9, false))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
        assert!(store.read_all().await.unwrap()[0].present);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_write_converges_without_duplicate() {
        let sheet = sheet();
        let store = store(&sheet);
        // read for the first attempt, then the append lands but never answers in time
        sheet.push_fault(Fault::Delay(Duration::ZERO));
        sheet.push_fault(Fault::LandThenStall(Duration::from_secs(60)));

        let r = record("m-1", 3, 9, true);
        assert_eq!(store.append_or_update(&r).await, Ok(WriteConfirmation::Unchanged));
        assert_eq!(sheet.rows("attendance").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_read_is_retried() {
        let sheet = sheet();
        let store = store(&sheet);
        sheet.fail_next(2, RemoteError::RateLimited);

        assert!(store.read_all().await.unwrap().is_empty());
        assert_eq!(sheet.read_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_mismatch_is_not_retried() {
        let sheet = sheet();
        sheet.set_rows(
            "attendance",
            vec![header_row(&["date", "member_id", "present", "recorded_at", "source"])],
        );
        let store = store(&sheet);

        let err = store.read_all().await.unwrap_err();
        assert!(matches!(err, RemoteError::SchemaMismatch(_)));
        assert_eq!(sheet.read_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_rows_collapse_to_latest() {
        let sheet = sheet();
        let early = record("m-1", 3, 9, false);
        let late = record("m-1", 3, 10, true);
        sheet.set_rows(
            "attendance",
            vec![
                header_row(&ATTENDANCE_HEADER),
                record_to_row(&late),
                record_to_row(&early),
            ],
        );
        let store = store(&sheet);
        assert_eq!(store.read_all().await.unwrap(), vec![late]);
    }

    #[tokio::test]
    async fn test_upsert_member_updates_in_place() {
        let sheet = sheet();
        let store = store(&sheet);
        let ruth = Member::new("m-1", "Ruth");
        store.upsert_member(&ruth).await.unwrap();

        let renamed = Member {
            display_name: "Ruth Okafor".to_string(),
            ..ruth
        };
        assert_eq!(store.upsert_member(&renamed).await, Ok(WriteConfirmation::Updated));
        assert_eq!(store.read_members().await.unwrap(), vec![renamed]);
    }
}
