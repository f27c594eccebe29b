use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::RecordKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Worksheet schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Remote row for {key} was recorded at {remote_recorded_at}, not older than this write")]
    Conflict {
        key: RecordKey,
        remote_recorded_at: DateTime<Utc>,
    },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RemoteError {
    /// Errors worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::RateLimited)
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let cut = (0..=MAX_ERROR_BODY_LENGTH)
                .rev()
                .find(|&i| body.is_char_boundary(i))
                .unwrap_or(0);
            format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => RemoteError::Unavailable("Unauthorized - token may be expired".to_string()),
            403 => RemoteError::Unavailable(format!("Access denied: {}", truncated)),
            404 => RemoteError::SchemaMismatch(format!("Worksheet not found: {}", truncated)),
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::Unavailable(format!("Server error: {}", truncated)),
            _ => RemoteError::Unavailable(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Unavailable(format!("Request timed out: {}", err))
        } else if err.is_decode() {
            RemoteError::SchemaMismatch(format!("Unexpected response body: {}", err))
        } else {
            RemoteError::Unavailable(format!("Network error: {}", err))
        }
    }
}
