use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to one dispatch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Spawned,
    Skipped,
    Finished,
    Retry,
    Closed,
    Recovered,
    Fixit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub kind: EntryKind,
    pub cell: String,
    #[serde(default)]
    pub message_id: Option<u64>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl JournalEntry {
    pub fn new(kind: EntryKind, cell: &str, message_id: Option<u64>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            cell: cell.to_string(),
            message_id,
            pid: None,
            detail: None,
        }
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only record of every spawn, skip and finish, one JSON object per
/// line at `<state>/daemon/dispatch.jsonl`.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append an entry. A journal write failure is logged, never fatal: the
    /// tracing output carries the same facts.
    pub fn append(&self, entry: &JournalEntry) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize journal entry");
                return;
            }
        };
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"))
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append to journal");
        }
    }

    /// The last `n` entries, oldest first. Unparseable lines are skipped.
    pub fn read_last(&self, n: usize) -> Vec<JournalEntry> {
        let Ok(file) = fs::File::open(&self.path) else {
            return Vec::new();
        };
        let mut entries: Vec<JournalEntry> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
        entries
    }
}
