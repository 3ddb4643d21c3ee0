use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ExitError, MailboxError};

/// Config file name constants.
pub const CONFIG_TOML: &str = ".colony.toml";
pub const CONFIG_JSON: &str = ".colony.json";

/// Environment overrides.
pub const ENV_CONFIG: &str = "COLONY_CONFIG";
pub const ENV_STATE_DIR: &str = "COLONY_STATE_DIR";

/// Find the config file path, preferring .colony.toml over .colony.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Resolve which config file to load.
///
/// Priority: explicit `--config` flag, then `$COLONY_CONFIG`, then the
/// current directory and its ancestors.
pub fn resolve_config_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(ENV_CONFIG)
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let cwd = std::env::current_dir().context("determining current directory")?;
    for dir in cwd.ancestors() {
        if let Some(found) = find_config(dir) {
            return Ok(found);
        }
    }
    Err(ExitError::Config(format!(
        "no {CONFIG_TOML} or {CONFIG_JSON} found in {} or its parents (set {ENV_CONFIG})",
        cwd.display()
    ))
    .into())
}

/// Top-level .colony.toml config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub version: String,
    /// Root of all persisted state. Defaults to `$COLONY_STATE_DIR`, then
    /// the platform data directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub cells: BTreeMap<String, CellSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DaemonConfig {
    #[serde(default = "default_poll_interval", alias = "pollIntervalSecs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stale_lock", alias = "staleLockSecs")]
    pub stale_lock_secs: u64,
    /// Age after which a message stuck in `dispatching` without a lock is
    /// reset to `opened`.
    #[serde(default = "default_dispatch_recovery", alias = "dispatchRecoverySecs")]
    pub dispatch_recovery_secs: u64,
    #[serde(default = "default_daily_quota", alias = "dailyQuota")]
    pub daily_quota: u32,
    /// Cells that never trigger autonomous work.
    #[serde(default)]
    pub protected: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stale_lock_secs: default_stale_lock(),
            dispatch_recovery_secs: default_dispatch_recovery(),
            daily_quota: default_daily_quota(),
            protected: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn is_protected(&self, cell: &str) -> bool {
        self.protected.iter().any(|p| p == cell)
    }
}

/// How worker processes are launched.
///
/// `args` may contain the placeholders `{prompt}`, `{cell}`, `{max_turns}`
/// and `{workdir}`, substituted per spawn.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_program")]
    pub program: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default = "default_max_runtime", alias = "maxRuntimeSecs")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_max_turns", alias = "maxTurns")]
    pub max_turns: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: default_worker_args(),
            max_runtime_secs: default_max_runtime(),
            max_turns: default_max_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BreakerConfig {
    /// Dispatches within `window_secs` above which the breaker trips.
    #[serde(default = "default_trip_threshold", alias = "tripThreshold")]
    pub trip_threshold: u32,
    #[serde(default = "default_breaker_window", alias = "windowSecs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown", alias = "cooldownSecs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_cooldown", alias = "maxCooldownSecs")]
    pub max_cooldown_secs: u64,
    /// How long a half-open probe must stay error-free to close the breaker.
    #[serde(default = "default_probe_window", alias = "probeWindowSecs")]
    pub probe_window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: default_trip_threshold(),
            window_secs: default_breaker_window(),
            cooldown_secs: default_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
            probe_window_secs: default_probe_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LimiterConfig {
    #[serde(default = "default_limiter_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_limiter_window", alias = "windowSecs")]
    pub window_secs: u64,
    /// Quiet period after which an entry decays back to baseline.
    #[serde(default = "default_quiet_reset", alias = "quietResetSecs")]
    pub quiet_reset_secs: u64,
    #[serde(default = "default_max_multiplier", alias = "maxMultiplier")]
    pub max_multiplier: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_limiter_attempts(),
            window_secs: default_limiter_window(),
            quiet_reset_secs: default_quiet_reset(),
            max_multiplier: default_max_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistryConfig {
    #[serde(default = "default_dispatch_threshold", alias = "dispatchThreshold")]
    pub dispatch_threshold: u64,
    #[serde(default = "default_retention_days", alias = "resolvedRetentionDays")]
    pub resolved_retention_days: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dispatch_threshold: default_dispatch_threshold(),
            resolved_retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WatcherConfig {
    /// Regexes with named groups `type` and `message` (optionally
    /// `component`). A line matching any of them is an error line.
    #[serde(default = "default_error_patterns", alias = "errorPatterns")]
    pub error_patterns: Vec<String>,
    /// Lines of preceding log text kept as sample context.
    #[serde(default = "default_context_lines", alias = "contextLines")]
    pub context_lines: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            error_patterns: default_error_patterns(),
            context_lines: default_context_lines(),
        }
    }
}

/// Where a cell lives. Resolved by name through [`CellDirectory`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CellSpec {
    /// Working directory the worker process is started in.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Log streams tailed by the watcher.
    #[serde(default)]
    pub logs: Vec<PathBuf>,
    /// Wake this cell on a fixed interval even without mail.
    #[serde(default, alias = "heartbeatSecs")]
    pub heartbeat_secs: Option<u64>,
}

// Default value functions for serde
fn default_poll_interval() -> u64 { 30 }
fn default_stale_lock() -> u64 { 1800 }
fn default_dispatch_recovery() -> u64 { 2400 }
fn default_daily_quota() -> u32 { 20 }
fn default_worker_program() -> String { "claude".into() }
fn default_worker_args() -> Vec<String> {
    vec![
        "-p".into(),
        "{prompt}".into(),
        "--max-turns".into(),
        "{max_turns}".into(),
        "--dangerously-skip-permissions".into(),
    ]
}
fn default_max_runtime() -> u64 { 900 }
fn default_max_turns() -> u32 { 40 }
fn default_trip_threshold() -> u32 { 10 }
fn default_breaker_window() -> u64 { 300 }
fn default_cooldown() -> u64 { 300 }
fn default_max_cooldown() -> u64 { 3600 }
fn default_probe_window() -> u64 { 120 }
fn default_limiter_attempts() -> u32 { 3 }
fn default_limiter_window() -> u64 { 3600 }
fn default_quiet_reset() -> u64 { 7200 }
fn default_max_multiplier() -> u32 { 16 }
fn default_dispatch_threshold() -> u64 { 2 }
fn default_retention_days() -> u32 { 30 }
fn default_context_lines() -> usize { 5 }
fn default_error_patterns() -> Vec<String> {
    vec![
        // Python-style "Traceback ... ValueError: msg" and "TypeError: msg"
        r"^(?:.*\s)?(?P<type>[A-Z][A-Za-z0-9_]*(?:Error|Exception))\s*:\s*(?P<message>.+)$".into(),
        // Leveled logs: "2024-01-01T00:00:00Z ERROR component: msg"
        r"^(?:\S+\s+)?(?P<type>ERROR|FATAL|PANIC)\s+(?:(?P<component>[A-Za-z0-9_.:-]+):\s+)?(?P<message>.+)$".into(),
        // Rust panics
        r"^thread '[^']*' (?P<type>panicked) at (?P<message>.+)$".into(),
    ]
}

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid .colony.toml: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid .colony.json: {e}")).into())
    }

    /// Reject configs that would make the daemon misbehave rather than fail
    /// at the first tick.
    pub fn validate(&self) -> anyhow::Result<()> {
        for name in self.cells.keys() {
            validate_cell_name(name)
                .map_err(|e| ExitError::Config(format!("[cells.{name}]: {e}")))?;
        }
        for name in &self.daemon.protected {
            if !self.cells.contains_key(name) {
                tracing::warn!(cell = %name, "protected cell is not declared under [cells]");
            }
        }
        for pattern in &self.watcher.error_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ExitError::Config(format!("invalid watcher pattern {pattern:?}: {e}"))
            })?;
        }
        if self.breaker.trip_threshold == 0 {
            return Err(ExitError::Config("breaker.trip_threshold must be > 0".into()).into());
        }
        if self.limiter.max_attempts == 0 {
            return Err(ExitError::Config("limiter.max_attempts must be > 0".into()).into());
        }
        Ok(())
    }

    /// Root directory for persisted state.
    pub fn state_root(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR)
            && !dir.is_empty()
        {
            return PathBuf::from(dir);
        }
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("colony")
    }

    pub fn directory(&self) -> CellDirectory {
        CellDirectory::new(self.cells.clone())
    }
}

/// Validates a cell name against `[a-z0-9][a-z0-9_-]*`, max 64 chars.
///
/// Cell names become directory and file names under the state root, so
/// anything that could escape it is rejected.
pub fn validate_cell_name(name: &str) -> Result<(), MailboxError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        && !name.starts_with('-')
        && !name.starts_with('_');
    if valid {
        Ok(())
    } else {
        Err(MailboxError::InvalidCell(name.to_string()))
    }
}

/// Maps a human-readable cell name to its locations.
#[derive(Debug, Clone, Default)]
pub struct CellDirectory {
    cells: BTreeMap<String, CellSpec>,
}

impl CellDirectory {
    pub fn new(cells: BTreeMap<String, CellSpec>) -> Self {
        Self { cells }
    }

    /// Convenience for tests and tools: known cells with empty specs.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cells: names
                .into_iter()
                .map(|n| (n.into(), CellSpec::default()))
                .collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&CellSpec> {
        self.cells.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellSpec)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: CellSpec) {
        self.cells.insert(name.into(), spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_toml_config() {
        let toml_str = r#"
version = "1"
state_dir = "/var/lib/colony"

[daemon]
poll_interval_secs = 10
stale_lock_secs = 600
daily_quota = 3
protected = ["queen"]

[worker]
program = "agent"
args = ["run", "{prompt}"]
max_runtime_secs = 60
max_turns = 5

[breaker]
trip_threshold = 4
cooldown_secs = 30

[limiter]
max_attempts = 2

[registry]
dispatch_threshold = 3

[cells.queen]

[cells.drone]
workdir = "/srv/drone"
logs = ["/srv/drone/app.log"]
heartbeat_secs = 3600
"#;

        let config = Config::parse_toml(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.state_root(), PathBuf::from("/var/lib/colony"));
        assert_eq!(config.daemon.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.daemon.daily_quota, 3);
        assert!(config.daemon.is_protected("queen"));
        assert!(!config.daemon.is_protected("drone"));
        assert_eq!(config.worker.program, "agent");
        assert_eq!(config.breaker.trip_threshold, 4);
        assert_eq!(config.breaker.window_secs, 300); // default
        assert_eq!(config.limiter.max_attempts, 2);
        assert_eq!(config.registry.dispatch_threshold, 3);

        let dir = config.directory();
        let drone = dir.resolve("drone").unwrap();
        assert_eq!(drone.heartbeat_secs, Some(3600));
        assert_eq!(drone.logs, vec![PathBuf::from("/srv/drone/app.log")]);
        assert!(dir.resolve("ghost").is_none());
    }

    #[test]
    fn parse_json_config_with_camel_case() {
        let json = r#"{
            "version": "1",
            "daemon": { "pollIntervalSecs": 5, "dailyQuota": 7 },
            "cells": { "drone": { "heartbeatSecs": 60 } }
        }"#;
        let config = Config::parse_json(json).unwrap();
        assert_eq!(config.daemon.poll_interval_secs, 5);
        assert_eq!(config.daemon.daily_quota, 7);
        assert_eq!(config.cells["drone"].heartbeat_secs, Some(60));
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let config = Config::parse_toml(r#"version = "1""#).unwrap();
        assert_eq!(config.daemon.poll_interval_secs, 30);
        assert_eq!(config.registry.dispatch_threshold, 2);
        assert_eq!(config.worker.program, "claude");
        assert!(config.worker.args.iter().any(|a| a == "{prompt}"));
        assert!(config.cells.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid .colony.toml"));
        assert!(err.downcast_ref::<ExitError>().is_some());
    }

    #[test]
    fn validate_rejects_bad_cell_names() {
        let config = Config::parse_toml(
            r#"
version = "1"
[cells."../etc"]
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_patterns() {
        let config = Config::parse_toml(
            r#"
version = "1"
[watcher]
error_patterns = ["(unclosed"]
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_patterns_compile() {
        for p in default_error_patterns() {
            regex::Regex::new(&p).unwrap();
        }
    }

    #[test]
    fn cell_name_validation() {
        assert!(validate_cell_name("drone").is_ok());
        assert!(validate_cell_name("worker_2").is_ok());
        assert!(validate_cell_name("a-b").is_ok());
        assert!(validate_cell_name("").is_err());
        assert!(validate_cell_name("-flag").is_err());
        assert!(validate_cell_name("Upper").is_err());
        assert!(validate_cell_name("a/b").is_err());
        assert!(validate_cell_name("..").is_err());
        assert!(validate_cell_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn find_config_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_TOML), "").unwrap();
        std::fs::write(dir.path().join(CONFIG_JSON), "").unwrap();
        let found = find_config(dir.path()).unwrap();
        assert!(found.to_string_lossy().ends_with(CONFIG_TOML));
    }

    #[test]
    fn find_config_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_config(dir.path()).is_none());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_TOML);
        std::fs::write(&path, "version = \"1\"\n[cells.drone]\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.directory().contains("drone"));
    }
}
