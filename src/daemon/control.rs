//! Operator controls: the global kill switch and the per-cell mute list.
//!
//! The kill switch is a marker file. Its presence pauses spawning; its
//! contents (reason, timestamp) are informational only, so a marker that
//! does not parse still counts as set.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExitError, StoreError};
use crate::store::{self, LockGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseMarker {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Control {
    dir: PathBuf,
}

impl Control {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn paused_path(&self) -> PathBuf {
        self.dir.join("paused")
    }

    fn muted_path(&self) -> PathBuf {
        self.dir.join("muted.json")
    }

    /// Current kill switch state. Failing to read it is fatal: the daemon
    /// must not spawn when it cannot tell whether it is allowed to.
    pub fn paused(&self) -> Result<Option<PauseMarker>, ExitError> {
        let path = self.paused_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text).unwrap_or(PauseMarker {
                reason: None,
                at: None,
            }))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExitError::Fatal(format!(
                "cannot read kill switch {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn pause(&self, reason: Option<String>) -> Result<PauseMarker, StoreError> {
        let marker = PauseMarker {
            reason,
            at: Some(Utc::now()),
        };
        store::write_json(&self.paused_path(), &marker)?;
        tracing::warn!(reason = ?marker.reason, "kill switch set");
        Ok(marker)
    }

    /// Clear the kill switch. Returns whether it was set.
    pub fn resume(&self) -> Result<bool, StoreError> {
        let path = self.paused_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("kill switch cleared");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
        }
    }

    pub fn muted(&self) -> Result<BTreeSet<String>, StoreError> {
        store::read_json_or_default(&self.muted_path())
    }

    pub fn is_muted(&self, cell: &str) -> Result<bool, StoreError> {
        Ok(self.muted()?.contains(cell))
    }

    /// Add or remove `cell` from the mute list. Returns whether the list
    /// changed.
    pub fn set_muted(&self, cell: &str, muted: bool) -> Result<bool, StoreError> {
        let _guard = LockGuard::acquire(&self.dir.join(".lock"), store::DEFAULT_LOCK_TIMEOUT)?;
        let mut set = self.muted()?;
        let changed = if muted {
            set.insert(cell.to_string())
        } else {
            set.remove(cell)
        };
        if changed {
            store::write_json(&self.muted_path(), &set)?;
            tracing::info!(cell, muted, "mute list updated");
        }
        Ok(changed)
    }
}
