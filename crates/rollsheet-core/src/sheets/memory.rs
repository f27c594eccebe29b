//! In-memory worksheet transport.
//!
//! Behaves like the remote values API (header row, append after the last
//! row, update by index) and can be scripted to fail, slow down or stall so
//! retry, timeout and degraded-mode paths can be exercised without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::schema::{header_row, ATTENDANCE_HEADER, MEMBERS_HEADER};
use super::{RemoteError, Row, SheetTransport};

/// A scripted misbehaviour for the next call, consumed in FIFO order.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call with this error.
    Fail(RemoteError),
    /// Wait before serving the call.
    Delay(Duration),
    /// Apply a write, then stall before answering. On reads this is a delay.
    LandThenStall(Duration),
}

#[derive(Debug, Default)]
struct State {
    sheets: HashMap<String, Vec<Row>>,
    faults: VecDeque<Fault>,
    read_delay: Option<Duration>,
    reads: usize,
    writes: usize,
}

#[derive(Debug, Default)]
pub struct MemorySheet {
    state: Mutex<State>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both worksheets present with their header rows and no data.
    pub fn with_headers(attendance_sheet: &str, members_sheet: &str) -> Self {
        let sheet = Self::new();
        sheet.set_rows(attendance_sheet, vec![header_row(&ATTENDANCE_HEADER)]);
        sheet.set_rows(members_sheet, vec![header_row(&MEMBERS_HEADER)]);
        sheet
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rows(&self, sheet: &str, rows: Vec<Row>) {
        self.lock().sheets.insert(sheet.to_string(), rows);
    }

    pub fn rows(&self, sheet: &str) -> Vec<Row> {
        self.lock().sheets.get(sheet).cloned().unwrap_or_default()
    }

    pub fn push_fault(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Fail the next `count` calls with `err`.
    pub fn fail_next(&self, count: usize, err: RemoteError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.faults.push_back(Fault::Fail(err.clone()));
        }
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Slow down every read, e.g. to hold a refresh in flight.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.lock().read_delay = delay;
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn begin_read(&self) -> (Option<Fault>, Option<Duration>) {
        let mut state = self.lock();
        state.reads += 1;
        (state.faults.pop_front(), state.read_delay)
    }

    fn begin_write(&self) -> Option<Fault> {
        let mut state = self.lock();
        state.writes += 1;
        state.faults.pop_front()
    }

    /// Run a write under the scripted fault, if any.
    async fn write_with<F>(&self, apply: F) -> Result<(), RemoteError>
    where
        F: FnOnce(&mut State) -> Result<(), RemoteError>,
    {
        match self.begin_write() {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                apply(&mut *self.lock())
            }
            Some(Fault::LandThenStall(stall)) => {
                apply(&mut *self.lock())?;
                tokio::time::sleep(stall).await;
                Ok(())
            }
            None => apply(&mut *self.lock()),
        }
    }
}

#[async_trait]
impl SheetTransport for MemorySheet {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Row>, RemoteError> {
        let (fault, read_delay) = self.begin_read();
        match fault {
            Some(Fault::Fail(err)) => return Err(err),
            Some(Fault::Delay(delay)) | Some(Fault::LandThenStall(delay)) => {
                tokio::time::sleep(delay).await;
            }
            None => {}
        }
        if let Some(delay) = read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.rows(sheet))
    }

    async fn append_row(&self, sheet: &str, row: Row) -> Result<(), RemoteError> {
        let sheet = sheet.to_string();
        self.write_with(move |state| {
            state.sheets.entry(sheet).or_default().push(row);
            Ok(())
        })
        .await
    }

    async fn update_row(&self, sheet: &str, index: usize, row: Row) -> Result<(), RemoteError> {
        let sheet = sheet.to_string();
        self.write_with(move |state| {
            let rows = state.sheets.entry(sheet.clone()).or_default();
            if index >= rows.len() {
                rows.resize(index + 1, Row::new());
            }
            rows[index] = row;
            Ok(())
        })
        .await
    }
}
