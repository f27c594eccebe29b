//! Application configuration management.
//!
//! Configuration covers the spreadsheet location, cache freshness, retry and
//! degraded-mode tuning, submission validation and the service schedule.
//!
//! Configuration is stored at `~/.config/rollsheet/config.json`. A missing
//! file yields defaults. `ROLLSHEET_SPREADSHEET_ID` and `ROLLSHEET_TOKEN`
//! override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Application name used for config directory paths
const APP_NAME: &str = "rollsheet";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Spreadsheet id override
pub const SPREADSHEET_ID_ENV: &str = "ROLLSHEET_SPREADSHEET_ID";

/// Bearer token supplied by the credential process
pub const TOKEN_ENV: &str = "ROLLSHEET_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sheets: SheetsConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub validation: ValidationConfig,
    pub schedule: ScheduleConfig,
    /// Never written to disk; only read from the environment.
    #[serde(skip)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    pub spreadsheet_id: Option<String>,
    pub attendance_sheet: String,
    pub members_sheet: String,
    pub base_url: String,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: None,
            attendance_sheet: "attendance".to_string(),
            members_sheet: "members".to_string(),
            base_url: "https://sheets.googleapis.com/v4/spreadsheets".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a fetched snapshot serves reads before a refresh.
    pub freshness_window_secs: u64,
    /// Upper bound for any single remote call.
    pub request_timeout_secs: u64,
    /// Consecutive remote failures before entering degraded mode.
    pub degraded_threshold: u32,
    /// Minimum spacing between remote attempts while degraded.
    pub degraded_retry_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 300,
            request_timeout_secs: 30,
            degraded_threshold: 3,
            degraded_retry_secs: 900,
        }
    }
}

impl SyncConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn degraded_retry(&self) -> Duration {
        Duration::from_secs(self.degraded_retry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// How many days past today an event date may be.
    pub future_date_tolerance_days: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            future_date_tolerance_days: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub service_days: Vec<Weekday>,
    pub extra_dates: Vec<NaiveDate>,
    pub cancelled_dates: Vec<NaiveDate>,
    /// Length of the window summarized by the dashboard, ending on its as-of date.
    pub dashboard_window_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            service_days: vec![Weekday::Sun],
            extra_dates: Vec::new(),
            cancelled_dates: Vec::new(),
            dashboard_window_days: 28,
        }
    }
}

impl Config {
    /// Load from the config file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `ROLLSHEET_SPREADSHEET_ID` and `ROLLSHEET_TOKEN` when set.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(SPREADSHEET_ID_ENV).ok(),
            std::env::var(TOKEN_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, spreadsheet_id: Option<String>, token: Option<String>) {
        if let Some(id) = spreadsheet_id.filter(|s| !s.trim().is_empty()) {
            self.sheets.spreadsheet_id = Some(id);
        }
        if let Some(token) = token.filter(|s| !s.trim().is_empty()) {
            self.token = Some(token);
        }
    }

    pub fn spreadsheet_id(&self) -> Result<&str> {
        self.sheets.spreadsheet_id.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No spreadsheet configured. Set {} or sheets.spreadsheet_id in {}",
                SPREADSHEET_ID_ENV,
                CONFIG_FILE
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sync.freshness_window(), Duration::from_secs(300));
        assert_eq!(config.sync.degraded_threshold, 3);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.schedule.service_days, vec![Weekday::Sun]);
        assert_eq!(config.sheets.attendance_sheet, "attendance");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let json = r#"{
            "sheets": { "spreadsheet_id": "abc123" },
            "schedule": { "service_days": ["Sun", "Wed"], "extra_dates": ["2024-12-25"] }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.sheets.spreadsheet_id.as_deref(), Some("abc123"));
        assert_eq!(config.sheets.members_sheet, "members");
        assert_eq!(config.schedule.service_days, vec![Weekday::Sun, Weekday::Wed]);
        assert_eq!(
            config.schedule.extra_dates,
            vec![NaiveDate::from_ymd_opt(2024, 12, 25).unwrap()]
        );
        assert_eq!(config.sync.request_timeout_secs, 30);
    }

    #[test]
    fn test_overrides_ignore_blank_values() {
        let mut config = Config::default();
        config.apply_overrides(Some("  ".to_string()), Some("tok".to_string()));
        assert_eq!(config.sheets.spreadsheet_id, None);
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert!(config.spreadsheet_id().is_err());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let mut config = Config::default();
        config.token = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
