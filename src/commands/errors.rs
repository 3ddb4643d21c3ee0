use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::Subcommand;
use serde::Serialize;

use super::inspect::daemon_running;
use super::{OutputFormat, Workspace, print_json};
use crate::daemon::fixit::{self, FixitOutcome};
use crate::gate::Gates;
use crate::registry::{ErrorFingerprint, ErrorRegistry, ErrorStatus, ReportOutcome, Sighting};

#[derive(Debug, Serialize)]
struct Reported {
    #[serde(flatten)]
    outcome: ReportOutcome,
    /// `None` when a running daemon owns delivery.
    fixits: Option<Vec<FixitOutcome>>,
}

#[derive(Debug, Subcommand)]
pub enum ErrorsCommand {
    /// List known errors, most recently seen first
    List {
        #[arg(long, value_enum)]
        status: Option<ErrorStatus>,
        #[arg(long)]
        component: Option<String>,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Record one occurrence of an error
    Report {
        /// Error class, e.g. TypeError
        #[arg(long = "type")]
        error_type: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        component: String,
        /// Log file the error came from
        #[arg(long)]
        log: Option<PathBuf>,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Stop an error from ever requesting dispatch
    Suppress { fingerprint: String },
    /// Mark an error fixed; a recurrence reactivates it
    Resolve { fingerprint: String },
    /// Drop resolved errors past the retention window
    Gc,
}

impl ErrorsCommand {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let registry = workspace.registry();
        match self {
            ErrorsCommand::List {
                status,
                component,
                format,
            } => {
                let errors = registry.query(*status, component.as_deref())?;
                print_errors(&errors, OutputFormat::resolve(*format))?;
            }
            ErrorsCommand::Report {
                error_type,
                message,
                component,
                log,
                format,
            } => {
                let mut sighting = Sighting::new(error_type, message, component);
                if let Some(log) = log {
                    sighting = sighting.log_path(log);
                }
                if workspace.config.directory().contains(component) {
                    sighting = sighting.owner(component);
                }
                let outcome = registry.report(&sighting)?;
                let fixits = route_fixits(&workspace, &registry)?;
                let report = Reported { outcome, fixits };
                match OutputFormat::resolve(*format) {
                    OutputFormat::Json => print_json(&report)?,
                    OutputFormat::Pretty | OutputFormat::Text => print_reported(&report),
                }
            }
            ErrorsCommand::Suppress { fingerprint } => {
                let entry = registry.suppress(fingerprint)?;
                println!("{} suppressed", entry.fingerprint);
            }
            ErrorsCommand::Resolve { fingerprint } => {
                let entry = registry.resolve(fingerprint)?;
                println!("{} resolved", entry.fingerprint);
            }
            ErrorsCommand::Gc => {
                let removed = registry.gc(Utc::now())?;
                println!("removed {} resolved error(s)", removed.len());
            }
        }
        Ok(())
    }
}

/// Deliver pending fix-its unless a daemon is running; the daemon routes
/// them on its next tick and owns the gate state meanwhile.
fn route_fixits(
    workspace: &Workspace,
    registry: &ErrorRegistry,
) -> anyhow::Result<Option<Vec<FixitOutcome>>> {
    if registry.pending_fixits()?.is_empty() || daemon_running(workspace)? {
        return Ok(None);
    }
    let mut gates = Gates::load(
        &workspace.paths.gates(),
        &workspace.config,
        Arc::clone(&workspace.bus),
    )?;
    let outcomes = fixit::route_pending(registry, &mut gates, &workspace.mailboxes(), Utc::now())?;
    Ok(Some(outcomes))
}

fn print_reported(report: &Reported) {
    let outcome = &report.outcome;
    println!(
        "{}  count={}  status={}  new={}  dispatch={}",
        outcome.fingerprint, outcome.count, outcome.status, outcome.is_new, outcome.should_dispatch
    );
    let Some(fixits) = &report.fixits else {
        if outcome.should_dispatch {
            println!("fix-it queued for the running daemon");
        }
        return;
    };
    for fixit in fixits {
        match fixit {
            FixitOutcome::Delivered {
                cell, message_id, ..
            } => println!("fix-it delivered  cell={cell}  id={message_id}"),
            FixitOutcome::Refused { cell, reason, .. } => {
                println!("fix-it deferred  cell={cell}  reason={reason}")
            }
            FixitOutcome::Failed { cell, error, .. } => {
                println!("fix-it failed  cell={cell}  error={error}")
            }
            FixitOutcome::Unrouted { component, .. } => {
                println!("fix-it dropped  component={component}  (no such cell)")
            }
        }
    }
}

fn print_errors(errors: &[ErrorFingerprint], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&errors)?,
        OutputFormat::Pretty => {
            println!("=== Errors ({}) ===\n", errors.len());
            for e in errors {
                println!(
                    "  {}  {:<10} ×{:<4} {}: {} [{}]",
                    e.fingerprint,
                    e.status.to_string(),
                    e.count,
                    e.error_type,
                    e.message,
                    e.component
                );
                println!(
                    "      first {}  last {}",
                    e.first_seen.format("%Y-%m-%d %H:%M"),
                    e.last_seen.format("%Y-%m-%d %H:%M")
                );
            }
        }
        OutputFormat::Text => {
            for e in errors {
                println!(
                    "error  fingerprint={}  status={}  count={}  component={}  type={}  message={}",
                    e.fingerprint, e.status, e.count, e.component, e.error_type, e.message
                );
            }
        }
    }
    Ok(())
}
