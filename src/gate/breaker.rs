//! Global circuit breaker.
//!
//! One [`CircuitBreaker`] owns the state and is the only writer. Every
//! change bumps `version`, is persisted atomically, and is published as a new
//! immutable [`BreakerSnapshot`]; readers take a snapshot and never see a
//! half-applied transition.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;
use crate::error::StoreError;
use crate::events::{Event, EventBus};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub v: u32,
    pub version: u64,
    pub state: BreakerState,
    pub opened_at: Option<DateTime<Utc>>,
    pub trip_threshold: u32,
    /// Current cooldown; doubles on each failed probe up to the cap.
    pub cooldown_secs: u64,
    /// Dispatches and errors inside the measurement window.
    pub recent: VecDeque<DateTime<Utc>>,
    pub probe_started_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub trips: u64,
}

impl BreakerSnapshot {
    fn initial(config: &BreakerConfig) -> Self {
        Self {
            v: 1,
            version: 0,
            state: BreakerState::Closed,
            opened_at: None,
            trip_threshold: config.trip_threshold,
            cooldown_secs: config.cooldown_secs,
            recent: VecDeque::new(),
            probe_started_at: None,
            last_error_at: None,
            trips: 0,
        }
    }

    /// When an open breaker may next let a probe through.
    pub fn reopens_at(&self) -> Option<DateTime<Utc>> {
        if self.state != BreakerState::Open {
            return None;
        }
        let since = match (self.opened_at, self.last_error_at) {
            (Some(o), Some(e)) => o.max(e),
            (Some(o), None) => o,
            (None, e) => e?,
        };
        Some(since + secs(self.cooldown_secs))
    }
}

fn secs(n: u64) -> Duration {
    Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1000))
}

#[derive(Debug)]
pub struct CircuitBreaker {
    path: PathBuf,
    config: BreakerConfig,
    bus: Arc<EventBus>,
    current: Arc<RwLock<Arc<BreakerSnapshot>>>,
}

impl CircuitBreaker {
    /// Load persisted state, or start closed. A corrupt file is an error:
    /// guessing "closed" after a storm would defeat the breaker.
    pub fn load(
        path: impl Into<PathBuf>,
        config: BreakerConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let mut snapshot =
            store::read_json::<BreakerSnapshot>(&path)?
                .unwrap_or_else(|| BreakerSnapshot::initial(&config));
        snapshot.trip_threshold = config.trip_threshold;
        Ok(Self {
            path,
            config,
            bus,
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
        })
    }

    /// Read the persisted snapshot without taking ownership of the breaker.
    pub fn read_snapshot(
        path: &Path,
        config: &BreakerConfig,
    ) -> Result<BreakerSnapshot, StoreError> {
        Ok(store::read_json(path)?.unwrap_or_else(|| BreakerSnapshot::initial(config)))
    }

    pub fn snapshot(&self) -> Arc<BreakerSnapshot> {
        match self.current.read() {
            Ok(s) => Arc::clone(&s),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn publish(&self, mut next: BreakerSnapshot) -> Result<(), StoreError> {
        let prev = self.snapshot();
        next.version = prev.version + 1;
        store::write_json(&self.path, &next)?;
        if prev.state != next.state {
            tracing::warn!(
                from = %prev.state,
                to = %next.state,
                cooldown_secs = next.cooldown_secs,
                "breaker state changed"
            );
            self.bus.publish(&Event::BreakerChanged {
                from: prev.state.to_string(),
                to: next.state.to_string(),
            });
        }
        let next = Arc::new(next);
        match self.current.write() {
            Ok(mut cur) => *cur = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }

    fn prune(&self, s: &mut BreakerSnapshot, now: DateTime<Utc>) {
        let horizon = now - secs(self.config.window_secs);
        while s.recent.front().is_some_and(|t| *t < horizon) {
            s.recent.pop_front();
        }
    }

    fn trip(&self, s: &mut BreakerSnapshot, now: DateTime<Utc>) {
        s.state = BreakerState::Open;
        s.opened_at = Some(now);
        s.probe_started_at = None;
        s.trips += 1;
        s.recent.clear();
    }

    /// Apply time-driven transitions: open → half_open once the cooldown has
    /// passed without errors, half_open → closed once a probe has run for
    /// the probe window without errors.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<BreakerState, StoreError> {
        let cur = self.snapshot();
        let mut next = (*cur).clone();
        match cur.state {
            BreakerState::Open => {
                if cur.reopens_at().is_none_or(|t| now >= t) {
                    next.state = BreakerState::HalfOpen;
                    next.probe_started_at = None;
                }
            }
            BreakerState::HalfOpen => {
                if let Some(probe) = cur.probe_started_at
                    && now >= probe + secs(self.config.probe_window_secs)
                {
                    next.state = BreakerState::Closed;
                    next.opened_at = None;
                    next.probe_started_at = None;
                    next.cooldown_secs = self.config.cooldown_secs;
                }
            }
            BreakerState::Closed => {}
        }
        let len = next.recent.len();
        self.prune(&mut next, now);
        if next.state != cur.state || next.recent.len() != len {
            let state = next.state;
            self.publish(next)?;
            return Ok(state);
        }
        Ok(cur.state)
    }

    /// Whether a dispatch may proceed now. In half-open only one probe is
    /// let through; it is claimed by [`record_dispatch`](Self::record_dispatch).
    pub fn allow(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(match self.refresh(now)? {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => self.snapshot().probe_started_at.is_none(),
        })
    }

    pub fn record_dispatch(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut next = (*self.snapshot()).clone();
        match next.state {
            BreakerState::HalfOpen if next.probe_started_at.is_none() => {
                next.probe_started_at = Some(now);
                tracing::info!("breaker probe dispatched");
            }
            BreakerState::Closed => {
                next.recent.push_back(now);
                self.prune(&mut next, now);
                if next.recent.len() > next.trip_threshold as usize {
                    tracing::error!(
                        window_secs = self.config.window_secs,
                        threshold = next.trip_threshold,
                        "dispatch rate exceeded, tripping breaker"
                    );
                    self.trip(&mut next, now);
                }
            }
            _ => {}
        }
        self.publish(next)
    }

    /// An error was observed system-wide (watcher sighting, failed worker).
    /// In half-open only an error after the probe went out fails it; before
    /// that there is nothing to judge yet.
    pub fn record_error(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut next = (*self.snapshot()).clone();
        next.last_error_at = Some(now);
        match next.state {
            BreakerState::HalfOpen if next.probe_started_at.is_some_and(|p| now >= p) => {
                next.cooldown_secs = next
                    .cooldown_secs
                    .saturating_mul(2)
                    .min(self.config.max_cooldown_secs);
                tracing::warn!(cooldown_secs = next.cooldown_secs, "breaker probe failed");
                self.trip(&mut next, now);
            }
            BreakerState::HalfOpen => {}
            BreakerState::Closed => {
                next.recent.push_back(now);
                self.prune(&mut next, now);
                if next.recent.len() > next.trip_threshold as usize {
                    tracing::error!(
                        threshold = next.trip_threshold,
                        "error rate exceeded, tripping breaker"
                    );
                    self.trip(&mut next, now);
                }
            }
            BreakerState::Open => {}
        }
        self.publish(next)
    }

    /// Operator override back to closed with the base cooldown.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut next = BreakerSnapshot::initial(&self.config);
        next.trips = self.snapshot().trips;
        self.publish(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            trip_threshold: 3,
            window_secs: 60,
            cooldown_secs: 100,
            max_cooldown_secs: 350,
            probe_window_secs: 30,
        }
    }

    fn breaker(dir: &Path) -> CircuitBreaker {
        CircuitBreaker::load(dir.join("breaker.json"), config(), EventBus::new()).unwrap()
    }

    fn t(s: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + s, 0).unwrap()
    }

    #[test]
    fn burst_trips_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let b = breaker(dir.path());
        for i in 0..4 {
            assert!(b.allow(t(i)).unwrap());
            b.record_error(t(i)).unwrap();
        }
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert!(!b.allow(t(50)).unwrap());

        // cooldown passes with no errors: one probe allowed
        assert!(b.allow(t(104)).unwrap());
        assert_eq!(b.snapshot().state, BreakerState::HalfOpen);
        b.record_dispatch(t(104)).unwrap();
        assert!(!b.allow(t(110)).unwrap(), "only one probe in half-open");

        assert!(b.allow(t(140)).unwrap());
        assert_eq!(b.snapshot().state, BreakerState::Closed);
        assert_eq!(b.snapshot().cooldown_secs, 100);
    }

    #[test]
    fn failed_trial_dispatch_doubles_cooldown_up_to_cap() {
        let dir = tempfile::tempdir().unwrap();
        let b = breaker(dir.path());
        for i in 0..4 {
            b.record_dispatch(t(i)).unwrap();
        }
        assert_eq!(b.snapshot().state, BreakerState::Open);

        let mut now = 3;
        for expected in [200, 350, 350] {
            now += b.snapshot().cooldown_secs as i64;
            assert!(b.allow(t(now)).unwrap());
            b.record_dispatch(t(now)).unwrap();
            now += 5;
            b.record_error(t(now)).unwrap();
            let s = b.snapshot();
            assert_eq!(s.state, BreakerState::Open);
            assert_eq!(s.cooldown_secs, expected);
        }
    }

    #[test]
    fn error_before_trial_dispatch_keeps_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let b = breaker(dir.path());
        for i in 0..4 {
            b.record_error(t(i)).unwrap();
        }
        assert_eq!(b.refresh(t(104)).unwrap(), BreakerState::HalfOpen);

        // a sighting arrives before anything was dispatched
        b.record_error(t(105)).unwrap();
        let s = b.snapshot();
        assert_eq!(s.state, BreakerState::HalfOpen);
        assert_eq!(s.cooldown_secs, 100);
        assert_eq!(s.trips, 1);

        // the probe still gets its chance and closes the breaker
        assert!(b.allow(t(106)).unwrap());
        b.record_dispatch(t(106)).unwrap();
        assert!(b.allow(t(140)).unwrap());
        assert_eq!(b.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn errors_while_open_extend_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let b = breaker(dir.path());
        for i in 0..4 {
            b.record_error(t(i)).unwrap();
        }
        b.record_error(t(90)).unwrap();
        assert!(!b.allow(t(150)).unwrap());
        assert!(b.allow(t(191)).unwrap());
    }

    #[test]
    fn events_outside_window_do_not_trip() {
        let dir = tempfile::tempdir().unwrap();
        let b = breaker(dir.path());
        for i in 0..10 {
            b.record_dispatch(t(i * 61)).unwrap();
        }
        assert_eq!(b.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn state_survives_reload_and_versions_increase() {
        let dir = tempfile::tempdir().unwrap();
        {
            let b = breaker(dir.path());
            for i in 0..4 {
                b.record_error(t(i)).unwrap();
            }
            assert!(b.snapshot().version >= 4);
        }
        let b = breaker(dir.path());
        assert_eq!(b.snapshot().state, BreakerState::Open);
        assert_eq!(b.snapshot().trips, 1);
        let read =
            CircuitBreaker::read_snapshot(&dir.path().join("breaker.json"), &config()).unwrap();
        assert_eq!(read.version, b.snapshot().version);
    }

    #[test]
    fn state_change_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let rx = bus.subscribe_channel(|e| matches!(e, Event::BreakerChanged { .. }));
        let b = CircuitBreaker::load(dir.path().join("breaker.json"), config(), bus).unwrap();
        for i in 0..4 {
            b.record_error(t(i)).unwrap();
        }
        let got: Vec<Event> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![Event::BreakerChanged {
                from: "closed".into(),
                to: "open".into()
            }]
        );
    }

    #[test]
    fn reset_closes() {
        let dir = tempfile::tempdir().unwrap();
        let b = breaker(dir.path());
        for i in 0..4 {
            b.record_error(t(i)).unwrap();
        }
        b.reset().unwrap();
        assert_eq!(b.snapshot().state, BreakerState::Closed);
        assert_eq!(b.snapshot().trips, 1);
    }
}
