//! REST client for the spreadsheet values API.
//!
//! Reads and writes whole rows of a worksheet through the `values` endpoints
//! using a bearer token supplied by the caller. Retries live one layer up in
//! `SheetStore`; this client makes exactly one request per call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{RemoteError, Row, SheetTransport};
use crate::config::Config;

/// Default base URL of the spreadsheet values API
pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueRangeBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<&'a str>,
    major_dimension: &'static str,
    values: [&'a Row; 1],
}

/// Spreadsheet API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct SheetsClient {
    client: Client,
    base_url: Url,
    spreadsheet_id: String,
    token: Option<String>,
}

impl SheetsClient {
    pub fn new(spreadsheet_id: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, spreadsheet_id, timeout)
    }

    pub fn with_base_url(
        base_url: &str,
        spreadsheet_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::Unavailable(format!("Invalid base URL {}: {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::from_transport(&e))?;

        Ok(Self {
            client,
            base_url,
            spreadsheet_id: spreadsheet_id.into(),
            token: None,
        })
    }

    /// Build a client for the configured spreadsheet, carrying the env-supplied token.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut client = Self::with_base_url(
            &config.sheets.base_url,
            config.spreadsheet_id()?,
            config.sync.request_timeout(),
        )?;
        if let Some(token) = &config.token {
            client.set_token(token.clone());
        }
        Ok(client)
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// `{base}/{spreadsheet}/values/{range}{suffix}` with the range percent-encoded.
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::Unavailable(format!("Base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .push(&self.spreadsheet_id)
            .push("values")
            .push(&format!("{}{}", range, suffix));
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::from_transport(&e))?;
        Self::check_response(response).await
    }
}

/// A1 notation for a whole row starting at column A. Sheet names that are
/// not plain identifiers are quoted.
fn row_range(sheet: &str, index: usize) -> String {
    format!("{}!A{}", quote_sheet(sheet), index + 1)
}

fn quote_sheet(sheet: &str) -> String {
    if !sheet.is_empty() && sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        sheet.to_string()
    } else {
        format!("'{}'", sheet.replace('\'', "''"))
    }
}

fn cell_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        other => other.to_string(),
    }
}

fn rows_from_body(body: &str) -> Result<Vec<Row>, RemoteError> {
    let parsed: ValueRange = serde_json::from_str(body)
        .map_err(|e| RemoteError::SchemaMismatch(format!("Failed to parse value range: {}", e)))?;
    Ok(parsed
        .values
        .into_iter()
        .map(|row| row.into_iter().map(cell_text).collect())
        .collect())
}

#[async_trait]
impl SheetTransport for SheetsClient {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Row>, RemoteError> {
        let url = self.values_url(&quote_sheet(sheet), "")?;
        let request = self.client.get(url).query(&[
            ("majorDimension", "ROWS"),
            ("valueRenderOption", "FORMATTED_VALUE"),
        ]);
        let response = self.send(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::from_transport(&e))?;
        let rows = rows_from_body(&body)?;
        debug!(sheet, rows = rows.len(), "Worksheet read");
        Ok(rows)
    }

    async fn append_row(&self, sheet: &str, row: Row) -> Result<(), RemoteError> {
        let range = quote_sheet(sheet);
        let url = self.values_url(&range, ":append")?;
        let body = ValueRangeBody {
            range: None,
            major_dimension: "ROWS",
            values: [&row],
        };
        let request = self
            .client
            .post(url)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&body);
        self.send(request).await?;
        debug!(sheet, "Row appended");
        Ok(())
    }

    async fn update_row(&self, sheet: &str, index: usize, row: Row) -> Result<(), RemoteError> {
        let range = row_range(sheet, index);
        let url = self.values_url(&range, "")?;
        let body = ValueRangeBody {
            range: Some(&range),
            major_dimension: "ROWS",
            values: [&row],
        };
        let request = self
            .client
            .put(url)
            .query(&[("valueInputOption", "RAW")])
            .json(&body);
        self.send(request).await?;
        debug!(sheet, index, "Row updated");
        Ok(())
    }
}
