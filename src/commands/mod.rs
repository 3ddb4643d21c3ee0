pub mod control;
pub mod daemon;
pub mod errors;
pub mod inspect;
pub mod mail;

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{self, Config};
use crate::daemon::StatePaths;
use crate::daemon::control::Control;
use crate::events::EventBus;
use crate::mailbox::MailboxStore;
use crate::registry::ErrorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, text when piped.
    pub fn resolve(explicit: Option<OutputFormat>) -> OutputFormat {
        explicit.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        })
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Loaded config plus the state root, shared by every command that touches
/// persisted state.
pub struct Workspace {
    pub config: Config,
    pub paths: StatePaths,
    pub bus: Arc<EventBus>,
}

impl Workspace {
    pub fn open(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let path = config::resolve_config_path(config_path)?;
        let config = Config::load(&path)?;
        tracing::debug!(config = %path.display(), "loaded config");
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            paths: StatePaths::new(config.state_root()),
            config,
            bus: EventBus::new(),
        }
    }

    pub fn mailboxes(&self) -> MailboxStore {
        MailboxStore::new(
            self.paths.mailboxes(),
            self.config.directory(),
            Arc::clone(&self.bus),
        )
    }

    pub fn registry(&self) -> ErrorRegistry {
        ErrorRegistry::new(
            self.paths.registry(),
            self.config.registry.clone(),
            Arc::clone(&self.bus),
        )
    }

    pub fn control(&self) -> Control {
        Control::new(self.paths.control())
    }
}
