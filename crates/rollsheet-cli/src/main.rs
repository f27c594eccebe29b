//! rollsheet - command-line front end for church attendance tracking.
//!
//! Drives the attendance service against the configured spreadsheet so an
//! operator can record attendance, manage members and inspect metrics.

mod format;

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rollsheet_core::aggregate::TrendBucket;
use rollsheet_core::sync::FlushOutcome;
use rollsheet_core::{AttendanceRecord, AttendanceService, Config, Member, ReconciliationResult};

/// Directory for daily rolling log files; logs go to stderr when unset
const LOG_DIR_ENV: &str = "ROLLSHEET_LOG_DIR";

/// Log file name prefix inside `ROLLSHEET_LOG_DIR`
const LOG_FILE_PREFIX: &str = "rollsheet.log";

#[derive(Parser)]
#[command(name = "rollsheet", version, about = "Church attendance backed by a spreadsheet")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check connectivity and worksheet headers
    Check,
    /// List members
    Members,
    /// Add or change a member
    Member {
        #[command(subcommand)]
        action: MemberAction,
    },
    /// Record attendance for one member
    Submit {
        member_id: String,
        date: NaiveDate,
        /// Record an absence instead of attendance
        #[arg(long)]
        absent: bool,
    },
    /// Import attendance records from a JSON file
    Import { file: PathBuf },
    /// Summary of the recent window
    Dashboard {
        /// Last day of the window, defaults to today
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Attendance metrics for one member
    Report {
        member_id: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    /// Attendance per week or month
    Trend {
        start: NaiveDate,
        end: NaiveDate,
        #[arg(long)]
        monthly: bool,
    },
    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum MemberAction {
    Add {
        member_id: String,
        display_name: String,
        #[arg(long)]
        group: Option<String>,
    },
    Rename {
        member_id: String,
        display_name: String,
    },
    /// Move to a group, or out of any group when none is given
    Regroup {
        member_id: String,
        group: Option<String>,
    },
    Deactivate {
        member_id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Write the default config file if none exists
    Init,
}

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG to control the level (e.g., RUST_LOG=rollsheet_core=debug).
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env();
            Ok(config)
        }
        None => Config::load(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    if let Command::Config { action } = &cli.command {
        return run_config(action, &config, cli.json);
    }

    let service = AttendanceService::from_config(&config)?;
    info!("rollsheet starting");
    let result = run(cli.command, &service, cli.json).await;
    let persisted = persist_pending(&service).await;
    result.and(persisted)
}

/// Writes queued during an outage live only in this process. Push them to
/// the remote store before exiting and fail if any could not be persisted.
async fn persist_pending(service: &AttendanceService) -> Result<()> {
    if service.pending().is_empty() {
        return Ok(());
    }
    for (record, outcome) in service.force_flush().await {
        match outcome {
            FlushOutcome::Persisted(_) => info!(key = %record.key(), "Queued write persisted"),
            FlushOutcome::Superseded => {
                eprintln!("{}: superseded by a newer remote record", record.key())
            }
            FlushOutcome::StillPending(err) => {
                eprintln!("{}: not persisted: {}", record.key(), err)
            }
            FlushOutcome::Deferred => eprintln!("{}: not persisted", record.key()),
        }
    }
    let lost = service.pending().len();
    if lost > 0 {
        bail!("{} attendance writes were not persisted", lost);
    }
    Ok(())
}

fn run_config(action: &ConfigAction, config: &Config, json: bool) -> Result<()> {
    match action {
        ConfigAction::Show => {
            if json {
                print_json(config)
            } else {
                println!("# {}", Config::config_path()?.display());
                println!("{}", serde_json::to_string_pretty(config)?);
                Ok(())
            }
        }
        ConfigAction::Init => {
            let path = Config::config_path()?;
            if path.exists() {
                println!("Config already exists at {}", path.display());
            } else {
                Config::default().save()?;
                println!("Wrote default config to {}", path.display());
            }
            Ok(())
        }
    }
}

async fn run(command: Command, service: &AttendanceService, json: bool) -> Result<()> {
    match command {
        Command::Check => {
            let report = service.check().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "OK: {} attendance records, {} members ({} active)",
                report.records, report.members, report.active_members
            );
            if report.pending > 0 {
                println!("{} writes pending", report.pending);
            }
        }
        Command::Members => {
            let members = service.members().await?;
            if json {
                return print_json(&members);
            }
            for member in &members {
                println!("{}", format::member_line(member));
            }
        }
        Command::Member { action } => {
            let confirmation = match action {
                MemberAction::Add {
                    member_id,
                    display_name,
                    group,
                } => {
                    let mut member = Member::new(member_id, display_name);
                    member.group = group;
                    service.add_member(member).await?
                }
                MemberAction::Rename {
                    member_id,
                    display_name,
                } => service.rename_member(&member_id, &display_name).await?,
                MemberAction::Regroup { member_id, group } => {
                    service.regroup_member(&member_id, group).await?
                }
                MemberAction::Deactivate { member_id } => {
                    service.deactivate_member(&member_id).await?
                }
            };
            println!("{:?}", confirmation);
        }
        Command::Submit {
            member_id,
            date,
            absent,
        } => {
            let result = service.submit_attendance(&member_id, date, !absent).await?;
            if json {
                return print_json(&result);
            }
            match result {
                ReconciliationResult::Accepted => println!("Recorded {} on {}", member_id, date),
                ReconciliationResult::SupersededDuplicate => {
                    println!("A newer record already exists for {} on {}", member_id, date)
                }
                ReconciliationResult::Rejected(reason) => println!("Rejected: {}", reason),
            }
        }
        Command::Import { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let records: Vec<AttendanceRecord> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let results = service.import_records(records).await?;
            if json {
                return print_json(&results);
            }
            let accepted = results
                .iter()
                .filter(|(_, r)| *r == ReconciliationResult::Accepted)
                .count();
            println!("Imported {} of {} records", accepted, results.len());
            for (key, result) in &results {
                if let ReconciliationResult::Rejected(reason) = result {
                    println!("  {}: {}", key, reason);
                }
            }
        }
        Command::Dashboard { as_of } => {
            let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
            let dash = service.dashboard_snapshot(as_of).await?;
            if json {
                return print_json(&dash);
            }
            println!("{} to {}", dash.period_start, dash.period_end);
            if dash.stale {
                println!("(stale: remote unreachable, data from {})", dash.cache_age);
            } else {
                println!("(data from {})", dash.cache_age);
            }
            for metric in &dash.aggregates {
                println!("  {:<20} {}", metric.name, metric.value);
            }
            for (date, count) in &dash.totals {
                println!("  {}  {}", date, count);
            }
            for line in format::sync_lines(&dash.sync_state) {
                println!("{}", line);
            }
        }
        Command::Report {
            member_id,
            start,
            end,
        } => {
            let report = service.member_report(&member_id, start, end).await?;
            if json {
                return print_json(&report);
            }
            println!("{} from {} to {}", member_id, start, end);
            for metric in &report {
                println!("  {:<20} {}", metric.name, metric.value);
            }
        }
        Command::Trend {
            start,
            end,
            monthly,
        } => {
            let bucket = if monthly {
                TrendBucket::Monthly
            } else {
                TrendBucket::Weekly
            };
            let points = service.trend(start, end, bucket).await?;
            if json {
                return print_json(&points);
            }
            println!("{:<12} {:>8} {:>8} {:>8}", "from", "services", "present", "average");
            for point in &points {
                println!(
                    "{:<12} {:>8} {:>8} {:>8}",
                    point.bucket_start.to_string(),
                    point.services,
                    point.present,
                    format::format_average(point.average_per_service)
                );
            }
        }
        Command::Config { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use rollsheet_core::sheets::schema::{header_row, member_to_row, MEMBERS_HEADER};
    use rollsheet_core::sheets::{MemorySheet, RetryPolicy, SheetStore};
    use rollsheet_core::{ManualClock, RemoteError};

    fn service() -> (Arc<MemorySheet>, AttendanceService) {
        let sheet = Arc::new(MemorySheet::with_headers("attendance", "members"));
        sheet.set_rows(
            "members",
            vec![header_row(&MEMBERS_HEADER), member_to_row(&Member::new("ruth", "Ruth"))],
        );
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap()));
        let store = SheetStore::new(Arc::clone(&sheet)).with_retry(RetryPolicy::no_retry());
        let service = AttendanceService::new(Arc::new(store), &Config::default(), clock);
        (sheet, service)
    }

    fn sunday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
    }

    #[tokio::test]
    async fn test_queued_write_is_persisted_before_exit() {
        let (sheet, service) = service();
        service.members().await.unwrap();
        sheet.fail_next(1, RemoteError::RateLimited);
        service.submit_attendance("ruth", sunday(), true).await.unwrap();
        assert_eq!(service.pending().len(), 1);

        persist_pending(&service).await.unwrap();
        assert!(service.pending().is_empty());
        assert_eq!(sheet.rows("attendance").len(), 2);
    }

    #[tokio::test]
    async fn test_unpersisted_write_fails_the_command() {
        let (sheet, service) = service();
        service.members().await.unwrap();
        sheet.fail_next(10, RemoteError::Unavailable("offline".into()));
        service.submit_attendance("ruth", sunday(), true).await.unwrap();

        let err = persist_pending(&service).await.unwrap_err();
        assert!(err.to_string().contains("1 attendance writes were not persisted"));
    }

    #[tokio::test]
    async fn test_nothing_pending_is_ok() {
        let (_, service) = service();
        persist_pending(&service).await.unwrap();
    }
}
