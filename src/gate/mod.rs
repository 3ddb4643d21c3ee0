//! Dispatch gates, evaluated in a fixed order: breaker, then the
//! per-entity limiter, then the per-cell daily quota.

pub mod breaker;
pub mod limiter;
pub mod quota;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::StoreError;
use crate::events::EventBus;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use limiter::{LimitKey, RateLimiter};
pub use quota::DailyQuota;

/// Why a dispatch did not happen. Refusals are policy, not failures: the
/// message stays `opened` and is reconsidered on a later tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Protected,
    Muted,
    Paused,
    BreakerOpen,
    RateLimited { key: String },
    QuotaExhausted { used: u32, limit: u32 },
    Locked { pid: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Protected => f.write_str("protected recipient"),
            SkipReason::Muted => f.write_str("cell muted"),
            SkipReason::Paused => f.write_str("kill switch set"),
            SkipReason::BreakerOpen => f.write_str("circuit breaker open"),
            SkipReason::RateLimited { key } => write!(f, "rate limited ({key})"),
            SkipReason::QuotaExhausted { used, limit } => {
                write!(f, "daily quota exhausted ({used}/{limit})")
            }
            SkipReason::Locked { pid } => write!(f, "cell busy (pid {pid})"),
        }
    }
}

#[derive(Debug)]
pub struct Gates {
    pub breaker: CircuitBreaker,
    pub limiter: RateLimiter,
    pub quota: DailyQuota,
}

impl Gates {
    pub fn load(dir: &Path, config: &Config, bus: Arc<EventBus>) -> Result<Self, StoreError> {
        Ok(Self {
            breaker: CircuitBreaker::load(dir.join("breaker.json"), config.breaker.clone(), bus)?,
            limiter: RateLimiter::load(dir.join("limiter.json"), config.limiter.clone())?,
            quota: DailyQuota::load(dir.join("quota.json"), config.daemon.daily_quota)?,
        })
    }

    /// Check a mail dispatch to `cell`. `quota_exempt` is set for the single
    /// retry of a failed dispatch.
    pub fn check_dispatch(
        &mut self,
        cell: &str,
        key: &LimitKey,
        quota_exempt: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<SkipReason>, StoreError> {
        if !self.breaker.allow(now)? {
            return Ok(Some(SkipReason::BreakerOpen));
        }
        if !self.limiter.check(key, now)? {
            return Ok(Some(SkipReason::RateLimited {
                key: key.to_string(),
            }));
        }
        if !quota_exempt && !self.quota.allow(cell, now) {
            return Ok(Some(SkipReason::QuotaExhausted {
                used: self.quota.used(cell, now),
                limit: self.quota.limit(),
            }));
        }
        Ok(None)
    }

    pub fn record_dispatch(
        &mut self,
        cell: &str,
        key: &LimitKey,
        quota_exempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.breaker.record_dispatch(now)?;
        self.limiter.record(key, now)?;
        if !quota_exempt {
            self.quota.record(cell, now)?;
        }
        Ok(())
    }

    /// Check a fix-it request for an error fingerprint. The spawn it leads
    /// to is gated again as ordinary mail.
    pub fn check_fixit(
        &mut self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SkipReason>, StoreError> {
        if !self.breaker.allow(now)? {
            return Ok(Some(SkipReason::BreakerOpen));
        }
        let key = LimitKey::Fingerprint(fingerprint.to_string());
        if !self.limiter.check(&key, now)? {
            return Ok(Some(SkipReason::RateLimited {
                key: key.to_string(),
            }));
        }
        Ok(None)
    }

    pub fn record_fixit(
        &mut self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.limiter
            .record(&LimitKey::Fingerprint(fingerprint.to_string()), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(quota: u32) -> Config {
        let mut config = Config::parse_toml(r#"version = "1""#).unwrap();
        config.daemon.daily_quota = quota;
        config.limiter.max_attempts = 5;
        config.breaker.trip_threshold = 50;
        config
    }

    #[test]
    fn quota_refuses_after_limit_but_retries_are_exempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut gates = Gates::load(dir.path(), &config(1), EventBus::new()).unwrap();
        let key = LimitKey::pair("queen", "drone");
        let now = Utc::now();

        assert_eq!(gates.check_dispatch("drone", &key, false, now).unwrap(), None);
        gates.record_dispatch("drone", &key, false, now).unwrap();
        assert_eq!(
            gates.check_dispatch("drone", &key, false, now).unwrap(),
            Some(SkipReason::QuotaExhausted { used: 1, limit: 1 })
        );
        assert_eq!(gates.check_dispatch("drone", &key, true, now).unwrap(), None);
    }

    #[test]
    fn breaker_is_consulted_before_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(100);
        config.breaker.trip_threshold = 1;
        config.limiter.max_attempts = 1;
        let mut gates = Gates::load(dir.path(), &config, EventBus::new()).unwrap();
        let key = LimitKey::pair("queen", "drone");
        let now = Utc::now();
        gates.record_dispatch("drone", &key, false, now).unwrap();
        gates.record_dispatch("drone", &key, false, now).unwrap();
        assert_eq!(
            gates.check_dispatch("drone", &key, false, now).unwrap(),
            Some(SkipReason::BreakerOpen)
        );
    }

    #[test]
    fn fixit_is_limited_per_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(100);
        config.limiter.max_attempts = 1;
        let mut gates = Gates::load(dir.path(), &config, EventBus::new()).unwrap();
        let now = Utc::now();
        assert_eq!(gates.check_fixit("aaa", now).unwrap(), None);
        gates.record_fixit("aaa", now).unwrap();
        assert!(matches!(
            gates.check_fixit("aaa", now).unwrap(),
            Some(SkipReason::RateLimited { .. })
        ));
        assert_eq!(gates.check_fixit("bbb", now).unwrap(), None);
    }

    #[test]
    fn skip_reasons_render() {
        assert_eq!(
            SkipReason::QuotaExhausted { used: 3, limit: 3 }.to_string(),
            "daily quota exhausted (3/3)"
        );
        let json = serde_json::to_value(SkipReason::Locked { pid: 9 }).unwrap();
        assert_eq!(json["reason"], "locked");
    }
}
