use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Args;

use super::{OutputFormat, Workspace, print_json};
use crate::daemon::{Daemon, TickReport};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Run a single tick, wait for the workers it spawned, and exit
    #[arg(long)]
    pub once: bool,
    /// Output format for --once
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl DaemonArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let mut daemon = Daemon::open(workspace.config)?;

        // First Ctrl-C asks the loop to stop; workers live in their own
        // process groups and keep running.
        let stop = Arc::new(AtomicBool::new(false));
        let handler_stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            eprintln!("Received interrupt signal, stopping after this tick...");
            handler_stop.store(true, Ordering::SeqCst);
        })
        .map_err(|e| ExitError::Other(format!("setting Ctrl-C handler: {e}")))?;

        if !self.once {
            return daemon.run(&stop);
        }

        let mut report = daemon.tick()?;
        report.finished.extend(daemon.drain(&stop)?);
        print_report(&report, OutputFormat::resolve(self.format))
    }
}

fn print_report(report: &TickReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Pretty => {
            println!("=== Tick ===\n");
            println!("Spawned: {}", report.spawned.len());
            for d in &report.spawned {
                println!("  • {} {}", d.cell, describe_id(d.message_id));
            }
            println!("Skipped: {}", report.skipped.len());
            for s in &report.skipped {
                println!("  • {} {}: {}", s.cell, describe_id(s.message_id), s.reason);
            }
            println!("Finished: {}", report.finished.len());
            for f in &report.finished {
                let status = f.status.map_or_else(|| "-".to_string(), |s| s.to_string());
                println!(
                    "  • {} {}: {} → {status}",
                    f.cell,
                    describe_id(f.message_id),
                    f.outcome.label()
                );
            }
            if !report.recovered.is_empty() {
                println!("Recovered: {}", report.recovered.len());
            }
            if !report.fixits.is_empty() {
                println!("Fix-it requests: {}", report.fixits.len());
            }
        }
        OutputFormat::Text => {
            for d in &report.spawned {
                println!("spawned  cell={}  message={}", d.cell, describe_id(d.message_id));
            }
            for s in &report.skipped {
                println!(
                    "skipped  cell={}  message={}  reason={}",
                    s.cell,
                    describe_id(s.message_id),
                    s.reason
                );
            }
            for f in &report.finished {
                let status = f.status.map_or_else(|| "-".to_string(), |s| s.to_string());
                println!(
                    "finished  cell={}  message={}  outcome={}  status={status}",
                    f.cell,
                    describe_id(f.message_id),
                    f.outcome.label()
                );
            }
            for r in &report.recovered {
                println!("recovered  cell={}  message={}", r.cell, describe_id(r.message_id));
            }
            for r in &report.fixits {
                println!("fixit  cell={}  message={}", r.cell, describe_id(r.message_id));
            }
        }
    }
    Ok(())
}

fn describe_id(id: Option<u64>) -> String {
    id.map_or_else(|| "heartbeat".to_string(), |id| format!("#{id}"))
}
