use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Args;
use schemars::schema_for;
use serde::Serialize;

use super::{OutputFormat, Workspace, print_json};
use crate::config::Config;
use crate::daemon::control::PauseMarker;
use crate::daemon::journal::{Journal, JournalEntry};
use crate::daemon::locks::{DispatchLock, LockTable};
use crate::error::{ExitError, StoreError};
use crate::events::EventBus;
use crate::gate::limiter::RateLimitEntry;
use crate::gate::{BreakerSnapshot, BreakerState, CircuitBreaker, DailyQuota, RateLimiter};
use crate::mailbox::MailboxCounts;
use crate::registry::ErrorStatus;
use crate::store::LockGuard;

/// Print the JSON Schema for `.colony.toml` to stdout.
pub fn run_schema() -> anyhow::Result<()> {
    let schema = schema_for!(Config);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Whether a daemon holds the instance lock on this state root.
pub(super) fn daemon_running(workspace: &Workspace) -> Result<bool, StoreError> {
    match LockGuard::acquire(&workspace.paths.daemon().join(".lock"), Duration::ZERO) {
        Ok(_guard) => Ok(false),
        Err(StoreError::LockTimeout { .. }) => Ok(true),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Args)]
pub struct BreakerArgs {
    /// Force the breaker closed (only while no daemon is running)
    #[arg(long)]
    pub reset: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl BreakerArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let path = workspace.paths.gates().join("breaker.json");
        if self.reset {
            if daemon_running(&workspace)? {
                return Err(ExitError::Other(
                    "a daemon owns the breaker; stop it (or `colony disable`) before resetting".into(),
                )
                .into());
            }
            CircuitBreaker::load(&path, workspace.config.breaker.clone(), EventBus::new())?
                .reset()?;
        }
        let snapshot = CircuitBreaker::read_snapshot(&path, &workspace.config.breaker)?;

        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => print_json(&snapshot)?,
            OutputFormat::Pretty => print_breaker_pretty(&snapshot),
            OutputFormat::Text => println!(
                "breaker  state={}  version={}  recent={}  threshold={}  cooldown={}s  trips={}",
                snapshot.state,
                snapshot.version,
                snapshot.recent.len(),
                snapshot.trip_threshold,
                snapshot.cooldown_secs,
                snapshot.trips
            ),
        }
        Ok(())
    }
}

fn print_breaker_pretty(snapshot: &BreakerSnapshot) {
    println!("=== Circuit Breaker ===\n");
    println!("State: {}", snapshot.state);
    println!(
        "Window: {} event(s), trips above {}",
        snapshot.recent.len(),
        snapshot.trip_threshold
    );
    println!("Cooldown: {}s", snapshot.cooldown_secs);
    if let Some(at) = snapshot.reopens_at() {
        println!("Probe allowed from: {}", at.to_rfc3339());
    }
    if snapshot.state == BreakerState::HalfOpen
        && let Some(at) = snapshot.probe_started_at
    {
        println!("Probe started: {}", at.to_rfc3339());
    }
    println!("Trips so far: {}", snapshot.trips);
}

#[derive(Debug, Args)]
pub struct LocksArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl LocksArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let locks = LockTable::new(workspace.paths.locks()).list()?;
        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => print_json(&locks)?,
            OutputFormat::Pretty => {
                println!("=== Dispatch Locks ({}) ===\n", locks.len());
                for lock in &locks {
                    println!("  • {}", describe_lock(lock));
                }
            }
            OutputFormat::Text => {
                for lock in &locks {
                    println!(
                        "lock  cell={}  message={}  pid={}  acquired={}",
                        lock.cell,
                        lock.message_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                        lock.live_pid(),
                        lock.acquired_at.to_rfc3339()
                    );
                }
            }
        }
        Ok(())
    }
}

fn describe_lock(lock: &DispatchLock) -> String {
    let what = lock
        .message_id
        .map_or_else(|| "heartbeat".to_string(), |id| format!("message #{id}"));
    format!(
        "{}: {what}, pid {}, since {}",
        lock.cell,
        lock.live_pid(),
        lock.acquired_at.format("%Y-%m-%d %H:%M:%S")
    )
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state_dir: String,
    pub daemon_running: bool,
    pub paused: Option<PauseMarker>,
    pub muted: BTreeSet<String>,
    pub breaker: BreakerSnapshot,
    pub cells: BTreeMap<String, CellStatus>,
    pub active_errors: usize,
    pub limited: BTreeMap<String, RateLimitEntry>,
    pub recent: Vec<JournalEntry>,
}

#[derive(Debug, Serialize)]
pub struct CellStatus {
    pub counts: MailboxCounts,
    pub quota_used: u32,
    pub quota_limit: u32,
    pub protected: bool,
    pub lock: Option<DispatchLock>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Journal entries to show
    #[arg(long, default_value = "10")]
    pub recent: usize,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl StatusArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let report = self.collect(&workspace, Utc::now())?;
        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => print_status_pretty(&report),
            OutputFormat::Text => print_status_text(&report),
            OutputFormat::Json => print_json(&report)?,
        }
        Ok(())
    }

    fn collect(&self, workspace: &Workspace, now: DateTime<Utc>) -> anyhow::Result<StatusReport> {
        let paths = &workspace.paths;
        let config = &workspace.config;
        let control = workspace.control();
        let mailboxes = workspace.mailboxes();
        let locks = LockTable::new(paths.locks());
        let mut quota =
            DailyQuota::load(paths.gates().join("quota.json"), config.daemon.daily_quota)?;
        let limiter =
            RateLimiter::load(paths.gates().join("limiter.json"), config.limiter.clone())?;

        let mut cells = BTreeMap::new();
        for cell in mailboxes.cells() {
            cells.insert(
                cell.clone(),
                CellStatus {
                    counts: mailboxes.counts(&cell)?,
                    quota_used: quota.used(&cell, now),
                    quota_limit: quota.limit(),
                    protected: config.daemon.is_protected(&cell),
                    lock: locks.get(&cell)?,
                },
            );
        }

        Ok(StatusReport {
            state_dir: paths.root.display().to_string(),
            daemon_running: daemon_running(workspace)?,
            paused: control.paused()?,
            muted: control.muted()?,
            breaker: CircuitBreaker::read_snapshot(
                &paths.gates().join("breaker.json"),
                &config.breaker,
            )?,
            cells,
            active_errors: workspace.registry().query(Some(ErrorStatus::Active), None)?.len(),
            limited: limiter
                .entries()
                .iter()
                .filter(|(_, e)| e.saturated || e.dropped > 0)
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect(),
            recent: Journal::new(paths.journal()).read_last(self.recent),
        })
    }
}

fn print_status_pretty(report: &StatusReport) {
    println!("=== Colony Status ===\n");
    println!("State: {}", report.state_dir);
    println!(
        "Daemon: {}",
        if report.daemon_running { "running" } else { "not running" }
    );
    match &report.paused {
        Some(marker) => println!(
            "Spawning: DISABLED{}",
            marker
                .reason
                .as_ref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        ),
        None => println!("Spawning: enabled"),
    }
    println!("Breaker: {}", report.breaker.state);
    if !report.muted.is_empty() {
        let muted: Vec<&str> = report.muted.iter().map(String::as_str).collect();
        println!("Muted: {}", muted.join(", "));
    }
    println!("Active errors: {}", report.active_errors);

    println!("\nCells:");
    for (name, cell) in &report.cells {
        let c = &cell.counts;
        let mut flags = Vec::new();
        if cell.protected {
            flags.push("protected".to_string());
        }
        if let Some(lock) = &cell.lock {
            flags.push(format!("busy pid {}", lock.live_pid()));
        }
        println!(
            "  {name:<16} unread {:<3} opened {:<3} dispatching {:<2} quota {}/{} {}",
            c.unread,
            c.opened,
            c.dispatching,
            cell.quota_used,
            cell.quota_limit,
            flags.join(", ")
        );
    }

    if !report.limited.is_empty() {
        println!("\nRate limited:");
        for (key, entry) in &report.limited {
            println!("  {key}  ×{} window, {} dropped", entry.multiplier, entry.dropped);
        }
    }
    if !report.recent.is_empty() {
        println!("\nRecent dispatch activity:");
        for e in &report.recent {
            println!("  {}", describe_entry(e));
        }
    }
}

fn print_status_text(report: &StatusReport) {
    println!("colony-status");
    println!(
        "daemon  running={}  paused={}  breaker={}  active-errors={}",
        report.daemon_running,
        report.paused.is_some(),
        report.breaker.state,
        report.active_errors
    );
    for (name, cell) in &report.cells {
        println!(
            "cell  name={name}  unread={}  opened={}  dispatching={}  quota={}/{}  protected={}  locked={}  muted={}",
            cell.counts.unread,
            cell.counts.opened,
            cell.counts.dispatching,
            cell.quota_used,
            cell.quota_limit,
            cell.protected,
            cell.lock.is_some(),
            report.muted.contains(name)
        );
    }
    for (key, entry) in &report.limited {
        println!("limited  key={key}  multiplier={}  dropped={}", entry.multiplier, entry.dropped);
    }
    for e in &report.recent {
        println!("journal  {}", describe_entry(e));
    }
}

fn describe_entry(e: &JournalEntry) -> String {
    let mut line = format!(
        "{} {:?} {}",
        e.at.format("%H:%M:%S"),
        e.kind,
        e.cell
    );
    if let Some(id) = e.message_id {
        line.push_str(&format!(" #{id}"));
    }
    if let Some(detail) = &e.detail {
        line.push_str(&format!(": {detail}"));
    }
    line
}
