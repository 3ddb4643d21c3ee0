//! Per-entity sliding-window rate limiter.
//!
//! Entities are error fingerprints (fix-it dispatch) and sender/recipient
//! pairs (mail dispatch). Each keeps its own window, so one runaway problem
//! can't eat the budget of an unrelated cell.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LimiterConfig;
use crate::error::StoreError;
use crate::store;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitKey {
    Fingerprint(String),
    Pair { from: String, to: String },
}

impl LimitKey {
    pub fn pair(from: impl Into<String>, to: impl Into<String>) -> Self {
        LimitKey::Pair {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKey::Fingerprint(fp) => write!(f, "err:{fp}"),
            LimitKey::Pair { from, to } => write!(f, "pair:{from}->{to}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub attempts: VecDeque<DateTime<Utc>>,
    /// Window stretch factor; doubles each time the entity saturates.
    pub multiplier: u32,
    pub last_attempt: DateTime<Utc>,
    /// Set once a refusal has doubled the multiplier, cleared by the next
    /// recorded attempt.
    #[serde(default)]
    pub saturated: bool,
    #[serde(default)]
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LimiterFile {
    schema_version: u32,
    entries: BTreeMap<String, RateLimitEntry>,
}

#[derive(Debug)]
pub struct RateLimiter {
    path: PathBuf,
    config: LimiterConfig,
    entries: BTreeMap<String, RateLimitEntry>,
}

fn secs(n: u64) -> Duration {
    Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1000))
}

impl RateLimiter {
    pub fn load(path: impl Into<PathBuf>, config: LimiterConfig) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = store::read_json::<LimiterFile>(&path)?
            .map(|f| f.entries)
            .unwrap_or_default();
        Ok(Self {
            path,
            config,
            entries,
        })
    }

    fn save(&self) -> Result<(), StoreError> {
        store::write_json(
            &self.path,
            &LimiterFile {
                schema_version: 1,
                entries: self.entries.clone(),
            },
        )
    }

    fn decay(&mut self, now: DateTime<Utc>) {
        let quiet = secs(self.config.quiet_reset_secs);
        self.entries.retain(|key, e| {
            let keep = now - e.last_attempt < quiet;
            if !keep {
                tracing::debug!(key = %key, "rate limit entry decayed to baseline");
            }
            keep
        });
    }

    /// Whether `key` may make another attempt now. A refusal doubles the
    /// entry's window multiplier once per saturation.
    pub fn check(&mut self, key: &LimitKey, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.decay(now);
        let Some(entry) = self.entries.get_mut(&key.to_string()) else {
            return Ok(true);
        };
        let multiplier = i32::try_from(entry.multiplier).unwrap_or(i32::MAX);
        let window = secs(self.config.window_secs) * multiplier;
        let horizon = now - window;
        while entry.attempts.front().is_some_and(|t| *t < horizon) {
            entry.attempts.pop_front();
        }
        if entry.attempts.len() < self.config.max_attempts as usize {
            return Ok(true);
        }

        entry.dropped += 1;
        if !entry.saturated {
            entry.saturated = true;
            entry.multiplier = entry
                .multiplier
                .saturating_mul(2)
                .min(self.config.max_multiplier.max(1));
        }
        tracing::warn!(
            key = %key,
            multiplier = entry.multiplier,
            dropped = entry.dropped,
            "rate limited"
        );
        self.save()?;
        Ok(false)
    }

    pub fn record(&mut self, key: &LimitKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                attempts: VecDeque::new(),
                multiplier: 1,
                last_attempt: now,
                saturated: false,
                dropped: 0,
            });
        entry.attempts.push_back(now);
        entry.last_attempt = now;
        entry.saturated = false;
        self.save()
    }

    pub fn entries(&self) -> &BTreeMap<String, RateLimitEntry> {
        &self.entries
    }
}
