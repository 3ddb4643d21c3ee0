//! Durable JSON state and per-key advisory locks.
//!
//! Every store in colony persists human-readable JSON. Writes go through a
//! temp file in the destination directory followed by an fsync and rename,
//! so readers only ever observe a complete document. Read-modify-write
//! sections are serialized by an exclusive `flock` on a sibling lock file,
//! scoped to one key (one cell, the registry, ...) so unrelated keys never
//! contend.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Default time a writer waits for a contended lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

pub fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) => ensure_dir(parent),
        None => Ok(()),
    }
}

/// Read a JSON document, returning `None` when the file does not exist.
///
/// A file that exists but does not parse is reported as corrupt: callers must
/// not paper over it with a default, since that would silently drop state.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

/// Read a JSON document or fall back to `T::default()` when absent.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    Ok(read_json(path)?.unwrap_or_default())
}

/// Atomically replace `path` with the pretty-printed JSON of `value`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let mut payload = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail: format!("serializing: {e}"),
    })?;
    payload.push(b'\n');
    write_atomic(path, &payload)
}

pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StoreError::io(format!("creating temp file in {}", parent.display()), e))?;
    temp.write_all(payload)
        .map_err(|e| StoreError::io("writing temp file", e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("syncing temp file", e))?;
    temp.persist(path)
        .map_err(|e| StoreError::io(format!("persisting {}", path.display()), e.error))?;
    Ok(())
}

/// Exclusive advisory lock on a lock file. Released when dropped, which
/// covers every exit path of the critical section including `?` returns.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock, retrying with jittered exponential backoff until
    /// `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        ensure_parent(path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io(format!("opening lock {}", path.display()), e))?;

        let start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(StoreError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    let delay = backoff_delay(attempt).min(timeout.saturating_sub(elapsed));
                    std::thread::sleep(delay.max(Duration::from_millis(1)));
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    return Err(StoreError::io(format!("locking {}", path.display()), e));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// 10ms doubling up to 160ms, plus up to 50% jitter so concurrent writers
/// don't retry in lockstep.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 10u64 << attempt.min(4);
    let jitter = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}

/// Retry an operation while it reports a transient failure.
pub fn retry_transient<T, E>(
    attempts: u32,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if attempt + 1 < attempts && is_transient(&e) => {
                std::thread::sleep(backoff_delay(attempt));
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Doc> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/doc.json");
        write_json(&path, &Doc { n: 7 }).unwrap();
        let got: Doc = read_json_or_default(&path).unwrap();
        assert_eq!(got, Doc { n: 7 });
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"n\": 7"), "should be pretty printed: {text}");
    }

    #[test]
    fn garbage_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, "{not json").unwrap();
        let err = read_json::<Doc>(&path).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn second_lock_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let held = LockGuard::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();

        // flock is per open file description, so a second handle in the
        // same process contends just like another process would.
        let err = LockGuard::acquire(&path, Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));

        drop(held);
        assert!(LockGuard::acquire(&path, Duration::from_millis(60)).is_ok());
    }

    #[test]
    fn retry_transient_stops_on_success() {
        let mut calls = 0;
        let result: Result<u32, &str> = retry_transient(
            5,
            |e| *e == "busy",
            || {
                calls += 1;
                if calls < 3 { Err("busy") } else { Ok(calls) }
            },
        );
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn retry_transient_gives_up_on_permanent_error() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_transient(
            5,
            |e| *e == "busy",
            || {
                calls += 1;
                Err("broken")
            },
        );
        assert_eq!(result, Err("broken"));
        assert_eq!(calls, 1);
    }
}
