//! Log watcher: tails each cell's log streams, extracts error lines and
//! feeds them to the error registry.
//!
//! Read positions are persisted per file in `offsets.json` and only advanced
//! after the lines before them have been reported, so a restart neither
//! replays history nor skips lines written while the watcher was down.
//! A file that shrank or was replaced (different inode) is read again from
//! the start. Only a log that already existed when it was first watched is
//! tailed from its end; one that shows up later is read in full.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CellDirectory, WatcherConfig};
use crate::error::{RegistryError, StoreError};
use crate::mailbox::NewMessage;
use crate::registry::{ErrorFingerprint, ErrorRegistry, ReportOutcome, Sighting};
use crate::store;

/// Sender name on fix-it messages.
pub const WATCHER_SENDER: &str = "watcher";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub offset: u64,
    pub inode: u64,
}

impl Offset {
    /// Recorded for a watched path that did not exist yet.
    pub const ABSENT: Offset = Offset { offset: 0, inode: 0 };
}

/// An error line pulled out of a log.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLine {
    pub error_type: String,
    pub message: String,
    pub component: Option<String>,
    /// Preceding lines plus the error line itself.
    pub context: Vec<String>,
}

/// A reported sighting, with the cell whose log it came from.
#[derive(Debug, Clone)]
pub struct Detection {
    pub cell: String,
    pub log_path: PathBuf,
    pub line: ErrorLine,
    pub outcome: ReportOutcome,
}

#[derive(Debug)]
pub struct LogWatcher {
    offsets_path: PathBuf,
    patterns: Vec<Regex>,
    context_lines: usize,
    offsets: BTreeMap<String, Offset>,
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

impl LogWatcher {
    pub fn load(offsets_path: impl Into<PathBuf>, config: &WatcherConfig) -> anyhow::Result<Self> {
        let offsets_path = offsets_path.into();
        let patterns = config
            .error_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let offsets = store::read_json_or_default(&offsets_path)?;
        Ok(Self {
            offsets_path,
            patterns,
            context_lines: config.context_lines,
            offsets,
        })
    }

    /// Parse one line against the configured patterns.
    pub fn extract(&self, line: &str) -> Option<(String, String, Option<String>)> {
        self.patterns.iter().find_map(|re| {
            let caps = re.captures(line)?;
            let error_type = caps.name("type")?.as_str().trim().to_string();
            let message = caps.name("message")?.as_str().trim().to_string();
            let component = caps
                .name("component")
                .map(|m| m.as_str().trim().to_string())
                .filter(|c| !c.is_empty());
            Some((error_type, message, component))
        })
    }

    /// Read complete new lines from `path`. Returns the error lines found
    /// and the offset to commit once they are handled; `None` when the file
    /// doesn't exist yet.
    pub fn scan(&self, path: &Path) -> Result<Option<(Vec<ErrorLine>, Offset)>, StoreError> {
        let key = path.display().to_string();
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(format!("opening {key}"), e)),
        };
        let meta = file
            .metadata()
            .map_err(|e| StoreError::io(format!("stat {key}"), e))?;
        let ino = inode(&meta);

        let start = match self.offsets.get(&key) {
            // first sight: tail from the end rather than replay history
            None => {
                return Ok(Some((Vec::new(), Offset { offset: meta.len(), inode: ino })));
            }
            Some(prev) if *prev == Offset::ABSENT => {
                tracing::info!(path = %key, "log appeared, reading from start");
                0
            }
            Some(prev) if prev.inode != ino => {
                tracing::info!(path = %key, "log replaced, reading from start");
                0
            }
            Some(prev) if meta.len() < prev.offset => {
                tracing::info!(path = %key, "log truncated, reading from start");
                0
            }
            Some(prev) => prev.offset,
        };

        file.seek(SeekFrom::Start(start))
            .map_err(|e| StoreError::io(format!("seeking {key}"), e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| StoreError::io(format!("reading {key}"), e))?;

        // a trailing partial line is left for the next scan
        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let text = String::from_utf8_lossy(&buf[..complete]);

        let mut recent: VecDeque<String> = VecDeque::with_capacity(self.context_lines + 1);
        let mut found = Vec::new();
        for line in text.lines() {
            if let Some((error_type, message, component)) = self.extract(line) {
                let mut context: Vec<String> = recent.iter().cloned().collect();
                context.push(line.to_string());
                found.push(ErrorLine {
                    error_type,
                    message,
                    component,
                    context,
                });
            }
            if self.context_lines > 0 {
                if recent.len() == self.context_lines {
                    recent.pop_front();
                }
                recent.push_back(line.to_string());
            }
        }
        Ok(Some((
            found,
            Offset {
                offset: start + complete as u64,
                inode: ino,
            },
        )))
    }

    pub fn commit(&mut self, path: &Path, offset: Offset) -> Result<(), StoreError> {
        let key = path.display().to_string();
        if self.offsets.get(&key) == Some(&offset) {
            return Ok(());
        }
        self.offsets.insert(key, offset);
        store::write_json(&self.offsets_path, &self.offsets)
    }

    /// Scan every log of every cell and report what was found.
    pub fn poll(
        &mut self,
        directory: &CellDirectory,
        registry: &ErrorRegistry,
    ) -> Result<Vec<Detection>, RegistryError> {
        let mut detections = Vec::new();
        for (cell, spec) in directory.iter() {
            for path in &spec.logs {
                let Some((lines, offset)) = self.scan(path)? else {
                    if !self.offsets.contains_key(&path.display().to_string()) {
                        self.commit(path, Offset::ABSENT)?;
                    }
                    continue;
                };
                for line in lines {
                    let component = line.component.clone().unwrap_or_else(|| cell.to_string());
                    let sighting = Sighting::new(&line.error_type, &line.message, component)
                        .owner(cell)
                        .log_path(path)
                        .context(line.context.clone());
                    let outcome = registry.report(&sighting)?;
                    detections.push(Detection {
                        cell: cell.to_string(),
                        log_path: path.clone(),
                        line,
                        outcome,
                    });
                }
                self.commit(path, offset)?;
            }
        }
        Ok(detections)
    }
}

/// The message a cell receives to fix a recurring error. Delivered already
/// opened with dispatch requested.
pub fn fixit_message(cell: &str, error: &ErrorFingerprint) -> NewMessage {
    let mut body = format!(
        "Recurring error in {cell}.\n\n\
         fingerprint: {fp}\n\
         type: {ty}\n\
         message: {msg}\n\
         component: {component}\n\
         occurrences: {count}\n\
         first seen: {first}\n\
         last seen: {last}\n",
        fp = error.fingerprint,
        ty = error.error_type,
        msg = error.message,
        component = error.component,
        count = error.count,
        first = error.first_seen.to_rfc3339(),
        last = error.last_seen.to_rfc3339(),
    );
    if let Some(path) = &error.log_path {
        body.push_str(&format!("log: {}\n", path.display()));
    }
    if !error.sample_context.is_empty() {
        body.push_str("\nRecent log context:\n");
        for line in &error.sample_context {
            body.push_str("    ");
            body.push_str(line);
            body.push('\n');
        }
    }
    body.push_str(&format!(
        "\nFind the root cause and fix it. When done: colony errors resolve {}\n",
        error.fingerprint
    ));
    NewMessage::new(
        WATCHER_SENDER,
        cell,
        format!("fix: {} in {} ({})", error.error_type, error.component, error.fingerprint),
        body,
    )
    .dispatch(true)
    .opened()
}
