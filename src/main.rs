use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use colony::commands::control::{self, DisableArgs, MuteArgs};
use colony::commands::daemon::DaemonArgs;
use colony::commands::errors::ErrorsCommand;
use colony::commands::inspect::{self, BreakerArgs, LocksArgs, StatusArgs};
use colony::commands::mail::{InboxArgs, MessageArgs, SendArgs};
use colony::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "colony",
    version,
    about = "Mailbox delivery, dispatch daemon, and error self-healing for worker cells"
)]
struct Cli {
    /// Config file (default: $COLONY_CONFIG, then .colony.toml / .colony.json
    /// in the current directory or a parent)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the dispatch daemon
    Daemon(DaemonArgs),
    /// Clear the kill switch
    Enable,
    /// Set the kill switch: the daemon keeps polling but spawns nothing
    Disable(DisableArgs),
    /// Stop dispatching to one cell
    Mute(MuteArgs),
    /// Resume dispatching to a muted cell
    Unmute(MuteArgs),
    /// Deliver a message to a cell's inbox
    Send(SendArgs),
    /// List a cell's messages
    Inbox(InboxArgs),
    /// Show a message, marking it opened
    Read(MessageArgs),
    /// Move a message to the cell's archive
    Archive(MessageArgs),
    /// Inspect and manage the error registry
    Errors {
        #[command(subcommand)]
        command: ErrorsCommand,
    },
    /// Inspect the circuit breaker
    Breaker(BreakerArgs),
    /// Inspect the dispatch lock table
    Locks(LocksArgs),
    /// Show daemon, cell, and gate status
    Status(StatusArgs),
    /// Print the JSON Schema for .colony.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Daemon(_) => "daemon",
            Self::Enable => "enable",
            Self::Disable(_) => "disable",
            Self::Mute(_) => "mute",
            Self::Unmute(_) => "unmute",
            Self::Send(_) => "send",
            Self::Inbox(_) => "inbox",
            Self::Read(_) => "read",
            Self::Archive(_) => "archive",
            Self::Errors { .. } => "errors",
            Self::Breaker(_) => "breaker",
            Self::Locks(_) => "locks",
            Self::Status(_) => "status",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let config = cli.config.as_deref();
    let result = match &cli.command {
        Commands::Daemon(args) => args.execute(config),
        Commands::Enable => control::enable(config),
        Commands::Disable(args) => args.execute(config),
        Commands::Mute(args) => args.execute(config, true),
        Commands::Unmute(args) => args.execute(config, false),
        Commands::Send(args) => args.execute(config),
        Commands::Inbox(args) => args.execute(config),
        Commands::Read(args) => args.read(config),
        Commands::Archive(args) => args.archive(config),
        Commands::Errors { command } => command.execute(config),
        Commands::Breaker(args) => args.execute(config),
        Commands::Locks(args) => args.execute(config),
        Commands::Status(args) => args.execute(config),
        Commands::Schema => inspect::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
