//! Deduplicated error fingerprints with occurrence counts.
//!
//! The registry is persisted on every write: dedup that forgets its history
//! on restart would re-dispatch everything it had already seen. Each
//! fingerprint is its own `<fp>.json` guarded by its own `<fp>.lock`, so
//! reports of unrelated errors never contend.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, StoreError};
use crate::events::{Event, EventBus};
use crate::store::{self, LockGuard};

const SCHEMA_VERSION: u32 = 1;
/// Hex characters kept from the sha256 digest.
const FINGERPRINT_LEN: usize = 16;
const MAX_SAMPLE_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Active,
    Suppressed,
    Resolved,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorStatus::Active => "active",
            ErrorStatus::Suppressed => "suppressed",
            ErrorStatus::Resolved => "resolved",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    pub fingerprint: String,
    pub error_type: String,
    /// Message after normalization; what the fingerprint was computed over.
    pub message: String,
    pub component: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub status: ErrorStatus,
    #[serde(default)]
    pub sample_context: Vec<String>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Cell whose log or report surfaced the error; fix-its go there.
    #[serde(default)]
    pub owner: Option<String>,
    /// The dispatch threshold was crossed and no fix-it has gone out yet.
    #[serde(default)]
    pub fixit_pending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    v: u32,
    #[serde(flatten)]
    error: ErrorFingerprint,
}

/// One observed error line.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub error_type: String,
    pub message: String,
    pub component: String,
    pub log_path: Option<PathBuf>,
    pub context: Vec<String>,
    pub owner: Option<String>,
}

impl Sighting {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            component: component.into(),
            log_path: None,
            context: Vec::new(),
            owner: None,
        }
    }

    pub fn owner(mut self, cell: impl Into<String>) -> Self {
        self.owner = Some(cell.into());
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn context(mut self, lines: Vec<String>) -> Self {
        self.context = lines;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportOutcome {
    pub fingerprint: String,
    pub is_new: bool,
    pub count: u64,
    pub status: ErrorStatus,
    /// A resolved error came back.
    pub reactivated: bool,
    /// This sighting made the error a confirmed pattern (the count reached
    /// the dispatch threshold, or a resolved error came back past it). The
    /// registry keeps the request pending until a fix-it is delivered.
    pub should_dispatch: bool,
}

fn re_uuid() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
    })
}

fn re_timestamp() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
            .unwrap()
    })
}

fn re_hex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:0x[0-9a-f]+|[0-9a-f]*\d[0-9a-f]*[a-f][0-9a-f]*)\b").unwrap()
    })
}

fn re_quoted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap())
}

fn re_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").unwrap())
}

fn re_space() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Strip the parts of an error message that vary between occurrences of
/// the same problem: ids, addresses, timestamps, literals, counts.
pub fn normalize(message: &str) -> String {
    let s = re_uuid().replace_all(message, "<uuid>");
    let s = re_timestamp().replace_all(&s, "<ts>");
    let s = re_quoted().replace_all(&s, "<str>");
    let s = re_hex().replace_all(&s, "<hex>");
    let s = re_number().replace_all(&s, "<n>");
    re_space().replace_all(s.trim(), " ").into_owned()
}

fn is_fingerprint(s: &str) -> bool {
    s.len() == FINGERPRINT_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Deterministic identity of an error pattern.
pub fn fingerprint(error_type: &str, message: &str, component: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_type.trim().as_bytes());
    hasher.update([0]);
    hasher.update(normalize(message).as_bytes());
    hasher.update([0]);
    hasher.update(component.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

#[derive(Debug, Clone)]
pub struct ErrorRegistry {
    dir: PathBuf,
    config: RegistryConfig,
    bus: Arc<EventBus>,
    lock_timeout: Duration,
}

impl ErrorRegistry {
    pub fn new(dir: impl Into<PathBuf>, config: RegistryConfig, bus: Arc<EventBus>) -> Self {
        Self {
            dir: dir.into(),
            config,
            bus,
            lock_timeout: store::DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    fn lock(&self, fingerprint: &str) -> Result<LockGuard, RegistryError> {
        Ok(LockGuard::acquire(
            &self.dir.join(format!("{fingerprint}.lock")),
            self.lock_timeout,
        )?)
    }

    fn load(&self, fingerprint: &str) -> Result<Option<ErrorFingerprint>, RegistryError> {
        Ok(store::read_json::<Record>(&self.path(fingerprint))?.map(|r| r.error))
    }

    fn save(&self, error: &ErrorFingerprint) -> Result<(), RegistryError> {
        let record = Record {
            v: SCHEMA_VERSION,
            error: error.clone(),
        };
        Ok(store::write_json(&self.path(&error.fingerprint), &record)?)
    }

    fn load_all(&self) -> Result<Vec<ErrorFingerprint>, RegistryError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::io(format!("listing {}", self.dir.display()), e).into());
            }
        };
        let mut errors = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| StoreError::io(format!("listing {}", self.dir.display()), e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(record) = store::read_json::<Record>(&path)? {
                errors.push(record.error);
            }
        }
        Ok(errors)
    }

    /// Read-modify-write one known fingerprint under its lock.
    fn update<T>(
        &self,
        fingerprint: &str,
        f: impl FnOnce(&mut ErrorFingerprint) -> T,
    ) -> Result<T, RegistryError> {
        let unknown = || RegistryError::UnknownFingerprint(fingerprint.to_string());
        if !is_fingerprint(fingerprint) {
            return Err(unknown());
        }
        let _guard = self.lock(fingerprint)?;
        let mut error = self.load(fingerprint)?.ok_or_else(unknown)?;
        let out = f(&mut error);
        self.save(&error)?;
        Ok(out)
    }

    /// Record a sighting. The first one is registered silently; later ones
    /// bump the count and may ask for dispatch.
    pub fn report(&self, sighting: &Sighting) -> Result<ReportOutcome, RegistryError> {
        self.report_at(sighting, Utc::now())
    }

    pub fn report_at(
        &self,
        sighting: &Sighting,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, RegistryError> {
        let fp = fingerprint(&sighting.error_type, &sighting.message, &sighting.component);
        let mut context = sighting.context.clone();
        if context.len() > MAX_SAMPLE_LINES {
            context.drain(..context.len() - MAX_SAMPLE_LINES);
        }

        let outcome = {
            let _guard = self.lock(&fp)?;
            let existing = self.load(&fp)?;
            let mut reactivated = false;
            let is_new = existing.is_none();
            let mut entry = existing.unwrap_or_else(|| ErrorFingerprint {
                    fingerprint: fp.clone(),
                    error_type: sighting.error_type.trim().to_string(),
                    message: normalize(&sighting.message),
                    component: sighting.component.trim().to_string(),
                    first_seen: now,
                    last_seen: now,
                    count: 0,
                    status: ErrorStatus::Active,
                    sample_context: Vec::new(),
                    log_path: None,
                    resolved_at: None,
                    owner: None,
                    fixit_pending: false,
                });
            entry.count += 1;
            entry.last_seen = now;
            if !context.is_empty() {
                entry.sample_context = context;
            }
            if sighting.log_path.is_some() {
                entry.log_path.clone_from(&sighting.log_path);
            }
            if sighting.owner.is_some() {
                entry.owner.clone_from(&sighting.owner);
            }
            if entry.status == ErrorStatus::Resolved {
                entry.status = ErrorStatus::Active;
                entry.resolved_at = None;
                reactivated = true;
            }
            // count 1 is always the silent first sighting
            let threshold = self.config.dispatch_threshold.max(2);
            let crossed = !is_new
                && entry.status == ErrorStatus::Active
                && (entry.count == threshold || (reactivated && entry.count >= threshold));
            if crossed {
                entry.fixit_pending = true;
            }
            let outcome = ReportOutcome {
                fingerprint: fp.clone(),
                is_new,
                count: entry.count,
                status: entry.status,
                reactivated,
                should_dispatch: crossed,
            };
            self.save(&entry)?;
            outcome
        };

        if outcome.is_new {
            tracing::info!(
                fingerprint = %fp,
                component = %sighting.component,
                "new error registered"
            );
        } else if outcome.reactivated {
            tracing::warn!(fingerprint = %fp, count = outcome.count, "resolved error recurred");
        } else {
            tracing::debug!(fingerprint = %fp, count = outcome.count, "error seen again");
        }
        self.bus.publish(&Event::ErrorDetected {
            fingerprint: fp,
            component: sighting.component.clone(),
            count: outcome.count,
            is_new: outcome.is_new,
        });
        Ok(outcome)
    }

    pub fn get(&self, fingerprint: &str) -> Result<Option<ErrorFingerprint>, RegistryError> {
        if !is_fingerprint(fingerprint) {
            return Ok(None);
        }
        self.load(fingerprint)
    }

    fn set_status(
        &self,
        fingerprint: &str,
        status: ErrorStatus,
    ) -> Result<ErrorFingerprint, RegistryError> {
        let updated = self.update(fingerprint, |entry| {
            entry.status = status;
            entry.resolved_at = (status == ErrorStatus::Resolved).then(Utc::now);
            entry.fixit_pending = false;
            entry.clone()
        })?;
        tracing::info!(fingerprint, %status, "error status changed");
        Ok(updated)
    }

    /// Active errors that crossed the dispatch threshold and still await a
    /// fix-it, oldest first.
    pub fn pending_fixits(&self) -> Result<Vec<ErrorFingerprint>, RegistryError> {
        let mut pending: Vec<ErrorFingerprint> = self
            .load_all()?
            .into_iter()
            .filter(|e| e.fixit_pending && e.status == ErrorStatus::Active)
            .collect();
        pending.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        Ok(pending)
    }

    /// Drop the pending request: its fix-it was delivered, or nobody owns it.
    pub fn clear_fixit(&self, fingerprint: &str) -> Result<(), RegistryError> {
        self.update(fingerprint, |entry| entry.fixit_pending = false)
    }

    /// Block all dispatch for this error. Counting continues.
    pub fn suppress(&self, fingerprint: &str) -> Result<ErrorFingerprint, RegistryError> {
        self.set_status(fingerprint, ErrorStatus::Suppressed)
    }

    /// Mark fixed. Eligible for [`gc`](Self::gc) once the retention window
    /// passes; a recurrence reactivates it.
    pub fn resolve(&self, fingerprint: &str) -> Result<ErrorFingerprint, RegistryError> {
        self.set_status(fingerprint, ErrorStatus::Resolved)
    }

    /// Errors filtered by status and component, most recently seen first.
    pub fn query(
        &self,
        status: Option<ErrorStatus>,
        component: Option<&str>,
    ) -> Result<Vec<ErrorFingerprint>, RegistryError> {
        let mut errors: Vec<ErrorFingerprint> = self
            .load_all()?
            .into_iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .filter(|e| component.is_none_or(|c| e.component == c))
            .collect();
        errors.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(errors)
    }

    /// Drop resolved errors older than the retention window. Returns the
    /// removed fingerprints.
    pub fn gc(&self, now: DateTime<Utc>) -> Result<Vec<String>, RegistryError> {
        let retention = chrono::Duration::days(i64::from(self.config.resolved_retention_days));
        let expired = |e: &ErrorFingerprint| {
            e.status == ErrorStatus::Resolved
                && e.resolved_at.unwrap_or(e.last_seen) + retention <= now
        };
        let mut removed = Vec::new();
        for candidate in self.load_all()?.into_iter().filter(|e| expired(e)) {
            let fp = candidate.fingerprint;
            let _guard = self.lock(&fp)?;
            // re-check under the lock: a report may have reactivated it
            if !self.load(&fp)?.is_some_and(|e| expired(&e)) {
                continue;
            }
            let path = self.path(&fp);
            fs::remove_file(&path)
                .map_err(|e| StoreError::io(format!("removing {}", path.display()), e))?;
            removed.push(fp);
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "garbage collected resolved errors");
        }
        Ok(removed)
    }

}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn registry(dir: &Path) -> ErrorRegistry {
        ErrorRegistry::new(dir.join("registry"), RegistryConfig::default(), EventBus::new())
    }

    #[test]
    fn normalize_strips_volatile_parts() {
        assert_eq!(
            normalize("user 42 not found at 0xdeadbeef"),
            normalize("user 7 not found at 0x1f2e")
        );
        assert_eq!(
            normalize("request 3f2b9c1e-1a2b-4c3d-8e9f-001122334455 failed"),
            "request <uuid> failed"
        );
        assert_eq!(normalize("key 'abc' missing"), "key <str> missing");
        assert_eq!(
            normalize("at 2024-05-01T10:00:00Z   timed out"),
            "at <ts> timed out"
        );
        assert_eq!(normalize("x is None"), "x is None");
    }

    #[test]
    fn fingerprint_is_a_pure_function() {
        let a = fingerprint("TypeError", "x is None", "drone");
        assert_eq!(a, fingerprint("TypeError", "x is None", "drone"));
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_ne!(a, fingerprint("TypeError", "x is None", "scout"));
        assert_ne!(a, fingerprint("ValueError", "x is None", "drone"));
        assert_eq!(
            fingerprint("E", "took 120ms", "c"),
            fingerprint("E", "took 87ms", "c")
        );
    }

    #[test]
    fn first_report_is_silent_second_requests_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let first = reg.report(&Sighting::new("TypeError", "x is None", "drone")).unwrap();
        assert!(first.is_new);
        assert_eq!(first.count, 1);
        assert!(!first.should_dispatch);

        let second = reg.report(&Sighting::new("TypeError", "x is None", "drone")).unwrap();
        assert!(!second.is_new);
        assert_eq!(second.count, 2);
        assert!(second.should_dispatch);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn burst_past_threshold_requests_one_fixit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let sighting = Sighting::new("TypeError", "x is None", "drone").owner("drone");
        let dispatching: Vec<bool> = (0..5)
            .map(|_| reg.report(&sighting).unwrap().should_dispatch)
            .collect();
        assert_eq!(dispatching, [false, true, false, false, false]);

        let pending = reg.pending_fixits().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].owner.as_deref(), Some("drone"));
        assert_eq!(pending[0].count, 5);

        reg.clear_fixit(&pending[0].fingerprint).unwrap();
        reg.report(&sighting).unwrap();
        assert!(reg.pending_fixits().unwrap().is_empty());
    }

    #[test]
    fn recurrence_after_resolve_requests_a_new_fixit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let sighting = Sighting::new("E", "boom", "drone");
        reg.report(&sighting).unwrap();
        let fp = reg.report(&sighting).unwrap().fingerprint;
        reg.clear_fixit(&fp).unwrap();
        reg.resolve(&fp).unwrap();

        let again = reg.report(&sighting).unwrap();
        assert!(again.reactivated);
        assert!(again.should_dispatch);
        assert_eq!(reg.pending_fixits().unwrap().len(), 1);
    }

    #[test]
    fn suppress_drops_a_pending_fixit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let sighting = Sighting::new("E", "boom", "drone");
        reg.report(&sighting).unwrap();
        let fp = reg.report(&sighting).unwrap().fingerprint;
        assert_eq!(reg.pending_fixits().unwrap().len(), 1);
        reg.suppress(&fp).unwrap();
        assert!(reg.pending_fixits().unwrap().is_empty());
        assert!(!reg.get(&fp).unwrap().unwrap().fixit_pending);
    }

    #[test]
    fn each_fingerprint_has_its_own_record_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.report(&Sighting::new("E", "a", "drone")).unwrap().fingerprint;
        let b = reg.report(&Sighting::new("E", "b", "drone")).unwrap().fingerprint;
        let root = dir.path().join("registry");
        for fp in [&a, &b] {
            assert!(root.join(format!("{fp}.json")).exists());
            assert!(root.join(format!("{fp}.lock")).exists());
        }
        let record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(root.join(format!("{a}.json"))).unwrap())
                .unwrap();
        assert_eq!(record["v"], 1);
        assert_eq!(record["fingerprint"], a.as_str());

        // holding one fingerprint's lock doesn't block another's report
        let _held = LockGuard::acquire(&root.join(format!("{a}.lock")), Duration::from_millis(10))
            .unwrap();
        let reg = reg.with_lock_timeout(Duration::from_millis(50));
        assert_eq!(reg.report(&Sighting::new("E", "b", "drone")).unwrap().count, 2);
        assert!(matches!(
            reg.report(&Sighting::new("E", "a", "drone")).unwrap_err(),
            RegistryError::Store(StoreError::LockTimeout { .. })
        ));
    }

    #[test]
    fn malformed_fingerprint_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let err = registry(dir.path()).suppress("../../etc/passwd").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownFingerprint(_)));
    }

    #[test]
    fn dedup_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..3 {
            registry(dir.path())
                .report(&Sighting::new("E", "boom", "drone"))
                .unwrap();
        }
        let all = registry(dir.path()).query(None, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].count, 3);
    }

    #[test]
    fn suppressed_errors_never_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let fp = reg.report(&Sighting::new("E", "boom", "drone")).unwrap().fingerprint;
        reg.suppress(&fp).unwrap();
        let again = reg.report(&Sighting::new("E", "boom", "drone")).unwrap();
        assert_eq!(again.status, ErrorStatus::Suppressed);
        assert_eq!(again.count, 2);
        assert!(!again.should_dispatch);
    }

    #[test]
    fn resolved_error_is_reactivated_on_recurrence() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let fp = reg.report(&Sighting::new("E", "boom", "drone")).unwrap().fingerprint;
        let resolved = reg.resolve(&fp).unwrap();
        assert!(resolved.resolved_at.is_some());

        let again = reg.report(&Sighting::new("E", "boom", "drone")).unwrap();
        assert!(again.reactivated);
        assert_eq!(again.status, ErrorStatus::Active);
        assert!(reg.get(&fp).unwrap().unwrap().resolved_at.is_none());
    }

    #[test]
    fn unknown_fingerprint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = registry(dir.path()).resolve("nope").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownFingerprint(_)));
    }

    #[test]
    fn query_filters_by_status_and_component() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.report(&Sighting::new("E", "a", "drone")).unwrap().fingerprint;
        reg.report(&Sighting::new("E", "b", "drone")).unwrap();
        reg.report(&Sighting::new("E", "c", "scout")).unwrap();
        reg.suppress(&a).unwrap();

        assert_eq!(reg.query(None, Some("drone")).unwrap().len(), 2);
        assert_eq!(reg.query(Some(ErrorStatus::Active), None).unwrap().len(), 2);
        let suppressed = reg.query(Some(ErrorStatus::Suppressed), Some("drone")).unwrap();
        assert_eq!(suppressed.len(), 1);
        assert_eq!(suppressed[0].fingerprint, a);
    }

    #[test]
    fn gc_removes_only_old_resolved_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let old = reg.report(&Sighting::new("E", "old", "drone")).unwrap().fingerprint;
        reg.report(&Sighting::new("E", "live", "drone")).unwrap();
        reg.resolve(&old).unwrap();

        assert!(reg.gc(Utc::now()).unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::days(31);
        assert_eq!(reg.gc(later).unwrap(), vec![old]);
        assert_eq!(reg.query(None, None).unwrap().len(), 1);
    }

    #[test]
    fn sample_context_keeps_latest_lines() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let lines: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
        let fp = reg
            .report(
                &Sighting::new("E", "boom", "drone")
                    .context(lines)
                    .log_path("/var/log/app.log"),
            )
            .unwrap()
            .fingerprint;
        let entry = reg.get(&fp).unwrap().unwrap();
        assert_eq!(entry.sample_context.len(), MAX_SAMPLE_LINES);
        assert_eq!(entry.sample_context.last().unwrap(), "line 29");
        assert_eq!(entry.log_path, Some(PathBuf::from("/var/log/app.log")));
    }
}
