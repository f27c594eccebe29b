//! Remote store adapter for the attendance spreadsheet.
//!
//! Two layers:
//! - `SheetTransport`: raw worksheet rows. Implemented by the REST client
//!   (`SheetsClient`) and by an in-memory worksheet (`MemorySheet`).
//! - `RemoteStore`: domain records. `SheetStore` implements it on top of any
//!   transport, adding schema checks, timeouts, retries and keyed upserts.

pub mod client;
pub mod error;
pub mod memory;
pub mod retry;
pub mod schema;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;

pub use client::SheetsClient;
pub use error::RemoteError;
pub use memory::{Fault, MemorySheet};
pub use retry::RetryPolicy;
pub use schema::Row;
pub use store::{RemoteStore, SheetStore, WriteConfirmation};

#[async_trait]
pub trait SheetTransport: Send + Sync {
    /// All rows of a worksheet, header included, in sheet order.
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Row>, RemoteError>;

    /// Append a row after the last non-empty row.
    async fn append_row(&self, sheet: &str, row: Row) -> Result<(), RemoteError>;

    /// Overwrite the row at `index`, as positioned in `read_rows` output.
    async fn update_row(&self, sheet: &str, index: usize, row: Row) -> Result<(), RemoteError>;
}

#[async_trait]
impl<T: SheetTransport + ?Sized> SheetTransport for Arc<T> {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Row>, RemoteError> {
        (**self).read_rows(sheet).await
    }

    async fn append_row(&self, sheet: &str, row: Row) -> Result<(), RemoteError> {
        (**self).append_row(sheet, row).await
    }

    async fn update_row(&self, sheet: &str, index: usize, row: Row) -> Result<(), RemoteError> {
        (**self).update_row(sheet, index, row).await
    }
}
