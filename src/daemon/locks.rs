//! Dispatch lock table: at most one live worker per cell.
//!
//! A lock is a JSON file created with `O_EXCL`, so two daemons (or two
//! ticks) racing for the same cell can't both win. Updates after creation
//! replace the file atomically, which never leaves the path empty.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchLock {
    pub v: u32,
    pub cell: String,
    /// Message being worked on; `None` for a heartbeat wake.
    pub message_id: Option<u64>,
    /// Daemon that took the lock.
    pub owner_pid: u32,
    /// Worker process, once spawned.
    pub worker_pid: Option<u32>,
    pub acquired_at: DateTime<Utc>,
}

impl DispatchLock {
    pub fn new(cell: &str, message_id: Option<u64>, now: DateTime<Utc>) -> Self {
        Self {
            v: 1,
            cell: cell.to_string(),
            message_id,
            owner_pid: std::process::id(),
            worker_pid: None,
            acquired_at: now,
        }
    }

    /// The pid whose liveness decides whether the lock is still in use.
    pub fn live_pid(&self) -> u32 {
        self.worker_pid.unwrap_or(self.owner_pid)
    }
}

#[derive(Debug)]
pub enum Acquire {
    Acquired,
    Held(DispatchLock),
}

#[derive(Debug, Clone)]
pub struct LockTable {
    dir: PathBuf,
}

impl LockTable {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, cell: &str) -> PathBuf {
        self.dir.join(format!("{cell}.lock"))
    }

    /// Non-blocking: a held lock is reported, never waited on.
    pub fn try_acquire(&self, lock: &DispatchLock) -> Result<Acquire, StoreError> {
        store::ensure_dir(&self.dir)?;
        let path = self.path(&lock.cell);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let mut payload = serde_json::to_vec_pretty(lock).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    detail: format!("serializing: {e}"),
                })?;
                payload.push(b'\n');
                file.write_all(&payload)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| StoreError::io(format!("writing {}", path.display()), e))?;
                Ok(Acquire::Acquired)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.get(&lock.cell)? {
                Some(held) => Ok(Acquire::Held(held)),
                // released between our create and read; next tick retries
                None => Ok(Acquire::Held(lock.clone())),
            },
            Err(e) => Err(StoreError::io(format!("creating {}", path.display()), e)),
        }
    }

    pub fn get(&self, cell: &str) -> Result<Option<DispatchLock>, StoreError> {
        match store::read_json(&self.path(cell)) {
            Ok(lock) => Ok(lock),
            // a lock file caught mid-create reads as corrupt; it is held
            Err(StoreError::Corrupt { .. }) => Ok(Some(DispatchLock {
                v: 1,
                cell: cell.to_string(),
                message_id: None,
                owner_pid: 0,
                worker_pid: None,
                acquired_at: self.mtime(cell).unwrap_or_else(Utc::now),
            })),
            Err(e) => Err(e),
        }
    }

    fn mtime(&self, cell: &str) -> Option<DateTime<Utc>> {
        let modified = fs::metadata(self.path(cell)).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }

    pub fn set_worker_pid(&self, cell: &str, pid: u32) -> Result<(), StoreError> {
        let Some(mut lock) = self.get(cell)? else {
            return Ok(());
        };
        lock.worker_pid = Some(pid);
        store::write_json(&self.path(cell), &lock)
    }

    pub fn release(&self, cell: &str) -> Result<(), StoreError> {
        let path = self.path(cell);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("removing {}", path.display()), e)),
        }
    }

    pub fn list(&self) -> Result<Vec<DispatchLock>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("listing {}", self.dir.display()), e)),
        };
        let mut locks = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("reading lock dir entry", e))?;
            let name = entry.file_name();
            let Some(cell) = name.to_str().and_then(|n| n.strip_suffix(".lock")) else {
                continue;
            };
            if let Some(lock) = self.get(cell)? {
                locks.push(lock);
            }
        }
        locks.sort_by(|a, b| a.cell.cmp(&b.cell));
        Ok(locks)
    }

    /// Release every lock older than `stale_after` whose process is gone.
    /// Returns the reclaimed locks so their messages can be recovered.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        is_alive: impl Fn(u32) -> bool,
    ) -> Result<Vec<DispatchLock>, StoreError> {
        let mut reclaimed = Vec::new();
        for lock in self.list()? {
            if now - lock.acquired_at < stale_after || is_alive(lock.live_pid()) {
                continue;
            }
            tracing::warn!(
                cell = %lock.cell,
                message_id = ?lock.message_id,
                pid = lock.live_pid(),
                "reclaiming stale dispatch lock"
            );
            self.release(&lock.cell)?;
            reclaimed.push(lock);
        }
        Ok(reclaimed)
    }
}
