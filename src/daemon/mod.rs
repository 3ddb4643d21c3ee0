//! Dispatch daemon.
//!
//! One tick: reap finished workers, reclaim stale locks, poll the log
//! watcher, wake heartbeat cells, then walk every mailbox and spawn a worker
//! for each eligible message in arrival order, at most one per cell.

pub mod control;
pub mod fixit;
pub mod journal;
pub mod locks;
pub mod worker;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::{ExitError, MailboxError, RegistryError, StoreError};
use crate::events::{Event, EventBus};
use crate::gate::{Gates, LimitKey, SkipReason};
use crate::mailbox::{MailboxStore, Message, MessageStatus};
use crate::registry::ErrorRegistry;
use crate::store::{self, LockGuard};
use crate::subprocess::is_process_alive;
use crate::watcher::LogWatcher;

use control::Control;
use fixit::FixitOutcome;
use journal::{EntryKind, Journal, JournalEntry};
use locks::{Acquire, DispatchLock, LockTable};
use worker::{ProcessRunner, WorkerHandle, WorkerOutcome, WorkerRequest, WorkerRunner};

/// Attempts after which a failing message is closed instead of retried.
const MAX_DISPATCH_ATTEMPTS: u32 = 2;
const BUSY_RETRIES: u32 = 5;
/// How often the run loop checks running workers between ticks.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Where every store lives under the state root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn mailboxes(&self) -> PathBuf {
        self.root.join("mailboxes")
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn gates(&self) -> PathBuf {
        self.root.join("gates")
    }

    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn control(&self) -> PathBuf {
        self.root.join("control")
    }

    pub fn offsets(&self) -> PathBuf {
        self.root.join("watcher").join("offsets.json")
    }

    pub fn daemon(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn journal(&self) -> PathBuf {
        self.daemon().join("dispatch.jsonl")
    }

    pub fn heartbeats(&self) -> PathBuf {
        self.daemon().join("heartbeats.json")
    }

    pub fn workers(&self) -> PathBuf {
        self.root.join("workers")
    }
}

/// What one tick did.
#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub spawned: Vec<Dispatched>,
    pub skipped: Vec<Skipped>,
    pub finished: Vec<Finished>,
    pub recovered: Vec<Dispatched>,
    pub fixits: Vec<Dispatched>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatched {
    pub cell: String,
    pub message_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Skipped {
    pub cell: String,
    pub message_id: Option<u64>,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finished {
    pub cell: String,
    pub message_id: Option<u64>,
    pub outcome: WorkerOutcome,
    pub status: Option<MessageStatus>,
}

struct Running {
    handle: Box<dyn WorkerHandle>,
    message_id: Option<u64>,
    started_at: DateTime<Utc>,
}

pub struct Daemon {
    config: Config,
    paths: StatePaths,
    bus: Arc<EventBus>,
    mailboxes: MailboxStore,
    registry: ErrorRegistry,
    gates: Gates,
    control: Control,
    locks: LockTable,
    journal: Journal,
    watcher: LogWatcher,
    runner: Box<dyn WorkerRunner>,
    running: BTreeMap<String, Running>,
    heartbeats: BTreeMap<String, DateTime<Utc>>,
    /// Last skip journaled per message, so a message waiting out a quota
    /// is recorded once rather than every tick.
    last_skip: BTreeMap<(String, Option<u64>), SkipReason>,
    /// Same, per fingerprint, for refused fix-it requests.
    last_fixit_skip: BTreeMap<String, SkipReason>,
    _instance: LockGuard,
}

/// Turn a fatal store condition into `ExitError::Fatal`; everything else
/// stays a recoverable error.
fn escalate(err: anyhow::Error) -> anyhow::Error {
    let corrupt = err.chain().any(|cause| {
        cause
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_fatal)
            || matches!(
                cause.downcast_ref::<MailboxError>(),
                Some(MailboxError::Store(StoreError::Corrupt { .. }))
            )
            || matches!(
                cause.downcast_ref::<RegistryError>(),
                Some(RegistryError::Store(StoreError::Corrupt { .. }))
            )
    });
    if corrupt && err.downcast_ref::<ExitError>().is_none() {
        return ExitError::Fatal(format!("{err:#}")).into();
    }
    err
}

fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ExitError>(), Some(ExitError::Fatal(_)))
}

impl Daemon {
    /// Open all stores under the configured state root with the real
    /// process runner.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let paths = StatePaths::new(config.state_root());
        let runner = ProcessRunner::new(&config.worker, paths.workers());
        Self::with_runner(config, paths, EventBus::new(), Box::new(runner))
    }

    pub fn with_runner(
        config: Config,
        paths: StatePaths,
        bus: Arc<EventBus>,
        runner: Box<dyn WorkerRunner>,
    ) -> anyhow::Result<Self> {
        store::ensure_dir(&paths.daemon())?;
        let instance = LockGuard::acquire(&paths.daemon().join(".lock"), Duration::ZERO)
            .map_err(|e| match e {
                StoreError::LockTimeout { .. } => anyhow::Error::from(ExitError::Other(format!(
                    "another daemon is already running on {}",
                    paths.root.display()
                ))),
                other => other.into(),
            })?;

        let mailboxes =
            MailboxStore::new(paths.mailboxes(), config.directory(), Arc::clone(&bus));
        let registry =
            ErrorRegistry::new(paths.registry(), config.registry.clone(), Arc::clone(&bus));
        let gates = Gates::load(&paths.gates(), &config, Arc::clone(&bus))
            .map_err(|e| escalate(e.into()))?;
        let watcher = LogWatcher::load(paths.offsets(), &config.watcher).map_err(escalate)?;
        let heartbeats: BTreeMap<String, DateTime<Utc>> =
            store::read_json_or_default(&paths.heartbeats()).map_err(|e| escalate(e.into()))?;

        tracing::info!(
            state = %paths.root.display(),
            cells = config.cells.len(),
            poll_secs = config.daemon.poll_interval_secs,
            "daemon starting"
        );
        Ok(Self {
            control: Control::new(paths.control()),
            locks: LockTable::new(paths.locks()),
            journal: Journal::new(paths.journal()),
            config,
            paths,
            bus,
            mailboxes,
            registry,
            gates,
            watcher,
            runner,
            running: BTreeMap::new(),
            heartbeats,
            last_skip: BTreeMap::new(),
            last_fixit_skip: BTreeMap::new(),
            _instance: instance,
        })
    }

    pub fn mailboxes(&self) -> &MailboxStore {
        &self.mailboxes
    }

    pub fn registry(&self) -> &ErrorRegistry {
        &self.registry
    }

    pub fn gates(&self) -> &Gates {
        &self.gates
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn running_cells(&self) -> Vec<String> {
        self.running.keys().cloned().collect()
    }

    /// One full pass. Only fatal conditions are returned as errors; per-cell
    /// problems are logged and the cell is retried next tick.
    pub fn tick(&mut self) -> anyhow::Result<TickReport> {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&mut self, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();
        let span = tracing::debug_span!("tick");
        let _enter = span.enter();

        self.reap_into(&mut report, now)?;
        self.sweep(&mut report, now).map_err(escalate)?;
        self.gates.breaker.refresh(now).map_err(|e| escalate(e.into()))?;
        self.watch(&mut report, now)?;

        // read once per tick and again before each spawn
        self.control.paused()?;
        self.heartbeat(&mut report, now)?;

        let cells: Vec<String> = self.mailboxes.cells();
        for cell in cells {
            if let Err(e) = self.dispatch_cell(&cell, &mut report, now) {
                let e = escalate(e);
                if is_fatal(&e) {
                    return Err(e);
                }
                tracing::warn!(
                    cell = %cell,
                    error = %format!("{e:#}"),
                    "dispatch pass failed, retrying next tick"
                );
            }
        }
        tracing::debug!(
            spawned = report.spawned.len(),
            skipped = report.skipped.len(),
            finished = report.finished.len(),
            "tick done"
        );
        Ok(report)
    }

    /// Collect finished workers only.
    pub fn reap(&mut self) -> anyhow::Result<Vec<Finished>> {
        let mut report = TickReport::default();
        self.reap_into(&mut report, Utc::now())?;
        Ok(report.finished)
    }

    fn reap_into(&mut self, report: &mut TickReport, now: DateTime<Utc>) -> anyhow::Result<()> {
        let cells: Vec<String> = self.running.keys().cloned().collect();
        for cell in cells {
            let outcome = match self.running.get_mut(&cell).map(|r| r.handle.poll()) {
                Some(Ok(Some(outcome))) => outcome,
                Some(Ok(None)) | None => continue,
                Some(Err(e)) => {
                    tracing::warn!(
                        cell = %cell,
                        error = %format!("{e:#}"),
                        "failed to poll worker"
                    );
                    WorkerOutcome::Failure {
                        code: None,
                        detail: format!("lost track of worker: {e}"),
                    }
                }
            };
            let Some(run) = self.running.remove(&cell) else {
                continue;
            };
            let finished = self.finish(&cell, &run, outcome, now).map_err(escalate)?;
            report.finished.push(finished);
        }
        Ok(())
    }

    /// Settle a finished worker: release the lock and apply the retry-once
    /// rule to its message.
    fn finish(
        &mut self,
        cell: &str,
        run: &Running,
        outcome: WorkerOutcome,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Finished> {
        let pid = run.handle.pid();
        let elapsed = (now - run.started_at).num_seconds();
        let max_runtime = Duration::from_secs(self.config.worker.max_runtime_secs);
        if outcome.is_success() {
            tracing::info!(
                cell,
                message_id = ?run.message_id,
                pid,
                elapsed_secs = elapsed,
                "worker finished"
            );
        } else {
            tracing::warn!(
                cell,
                message_id = ?run.message_id,
                pid,
                elapsed_secs = elapsed,
                outcome = outcome.label(),
                "worker failed"
            );
            self.gates.breaker.record_error(now)?;
        }

        let status = match run.message_id {
            Some(id) => Some(self.settle_message(cell, id, &outcome, max_runtime)?),
            None => None,
        };
        self.locks.release(cell)?;

        self.journal.append(
            &JournalEntry::new(EntryKind::Finished, cell, run.message_id)
                .pid(pid)
                .detail(outcome.describe(max_runtime)),
        );
        self.bus.publish(&Event::DispatchFinished {
            cell: cell.to_string(),
            message_id: run.message_id,
            outcome: outcome.label().to_string(),
            status,
        });
        Ok(Finished {
            cell: cell.to_string(),
            message_id: run.message_id,
            outcome,
            status,
        })
    }

    fn settle_message(
        &self,
        cell: &str,
        id: u64,
        outcome: &WorkerOutcome,
        max_runtime: Duration,
    ) -> anyhow::Result<MessageStatus> {
        let message = self.mailboxes.get(cell, id)?;
        if message.status != MessageStatus::Dispatching {
            // closed or archived by the worker itself
            return Ok(message.status);
        }
        if outcome.is_success() {
            self.with_busy_retry(|m| m.close(cell, id, None))?;
            return Ok(MessageStatus::Closed);
        }

        let failure = outcome.describe(max_runtime);
        let progressed = match message.dispatched_at {
            Some(at) => self.mailboxes.sent_since(cell, at)?,
            None => false,
        };
        if !progressed && message.dispatch_attempts < MAX_DISPATCH_ATTEMPTS {
            self.with_busy_retry(|m| m.reopen(cell, id, Some(failure.clone())))?;
            tracing::info!(cell, message_id = id, "message reopened for one retry");
            self.journal
                .append(&JournalEntry::new(EntryKind::Retry, cell, Some(id)).detail(&failure));
            Ok(MessageStatus::Opened)
        } else {
            self.with_busy_retry(|m| m.close(cell, id, Some(failure.clone())))?;
            tracing::warn!(
                cell,
                message_id = id,
                failure = %failure,
                "message closed after failed dispatch"
            );
            self.journal
                .append(&JournalEntry::new(EntryKind::Closed, cell, Some(id)).detail(&failure));
            Ok(MessageStatus::Closed)
        }
    }

    fn with_busy_retry<T>(
        &self,
        op: impl Fn(&MailboxStore) -> Result<T, MailboxError>,
    ) -> Result<T, MailboxError> {
        store::retry_transient(BUSY_RETRIES, MailboxError::is_transient, || op(&self.mailboxes))
    }

    /// Reclaim stale locks and recover messages stuck in `dispatching`.
    fn sweep(&mut self, report: &mut TickReport, now: DateTime<Utc>) -> anyhow::Result<()> {
        let stale_after = chrono::Duration::seconds(
            i64::try_from(self.config.daemon.stale_lock_secs).unwrap_or(i64::MAX / 1000),
        );
        let running = &self.running;
        let reclaimed = self.locks.sweep(now, stale_after, |pid| {
            running.values().any(|r| r.handle.pid() == pid) || is_process_alive(pid)
        })?;
        for lock in reclaimed {
            if let Some(id) = lock.message_id {
                self.recover(&lock.cell, id, "stale dispatch lock reclaimed", report)?;
            }
        }

        let recovery_after = chrono::Duration::seconds(
            i64::try_from(self.config.daemon.dispatch_recovery_secs).unwrap_or(i64::MAX / 1000),
        );
        for cell in self.mailboxes.cells() {
            if self.running.contains_key(&cell) || self.locks.get(&cell)?.is_some() {
                continue;
            }
            for message in self.mailboxes.in_dispatch(&cell)? {
                let stuck = message
                    .dispatched_at
                    .is_none_or(|at| now - at >= recovery_after);
                if stuck {
                    self.recover(&cell, message.id, "stuck in dispatching", report)?;
                }
            }
        }
        Ok(())
    }

    fn recover(
        &mut self,
        cell: &str,
        id: u64,
        why: &str,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let message = match self.mailboxes.get(cell, id) {
            Ok(m) => m,
            Err(MailboxError::UnknownMessage { .. } | MailboxError::UnknownRecipient(_)) => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if message.status != MessageStatus::Dispatching {
            return Ok(());
        }
        if message.dispatch_attempts < MAX_DISPATCH_ATTEMPTS {
            self.with_busy_retry(|m| m.reopen(cell, id, Some(why.to_string())))?;
        } else {
            self.with_busy_retry(|m| m.close(cell, id, Some(why.to_string())))?;
        }
        tracing::warn!(
            cell,
            message_id = id,
            reason = why,
            attempts = message.dispatch_attempts,
            "recovered message"
        );
        self.journal
            .append(&JournalEntry::new(EntryKind::Recovered, cell, Some(id)).detail(why));
        report.recovered.push(Dispatched {
            cell: cell.to_string(),
            message_id: Some(id),
        });
        Ok(())
    }

    /// Poll the log watcher, count every sighting against the breaker, and
    /// route pending fix-it requests through the breaker and the
    /// per-fingerprint limiter.
    fn watch(&mut self, report: &mut TickReport, now: DateTime<Utc>) -> anyhow::Result<()> {
        let detections = self
            .watcher
            .poll(self.mailboxes.directory(), &self.registry)
            .map_err(|e| escalate(e.into()))?;
        for _ in &detections {
            self.gates.breaker.record_error(now).map_err(|e| escalate(e.into()))?;
        }

        let outcomes =
            match fixit::route_pending(&self.registry, &mut self.gates, &self.mailboxes, now) {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    let e = escalate(e);
                    if is_fatal(&e) {
                        return Err(e);
                    }
                    tracing::warn!(
                        error = %format!("{e:#}"),
                        "fix-it routing failed, retrying next tick"
                    );
                    return Ok(());
                }
            };
        for outcome in outcomes {
            self.record_fixit(report, outcome);
        }
        Ok(())
    }

    fn record_fixit(&mut self, report: &mut TickReport, outcome: FixitOutcome) {
        match outcome {
            FixitOutcome::Delivered {
                cell,
                fingerprint,
                message_id,
            } => {
                self.last_fixit_skip.remove(&fingerprint);
                self.journal.append(
                    &JournalEntry::new(EntryKind::Fixit, &cell, Some(message_id))
                        .detail(fingerprint),
                );
                report.fixits.push(Dispatched {
                    cell,
                    message_id: Some(message_id),
                });
            }
            FixitOutcome::Refused {
                cell,
                fingerprint,
                reason,
            } => {
                if self.last_fixit_skip.get(&fingerprint) != Some(&reason) {
                    tracing::warn!(
                        cell = %cell,
                        fingerprint = %fingerprint,
                        reason = %reason,
                        "fix-it request refused"
                    );
                    self.journal.append(
                        &JournalEntry::new(EntryKind::Skipped, &cell, None)
                            .detail(format!("fix-it {fingerprint}: {reason}")),
                    );
                    self.last_fixit_skip.insert(fingerprint, reason.clone());
                }
                report.skipped.push(Skipped {
                    cell,
                    message_id: None,
                    reason,
                });
            }
            FixitOutcome::Failed {
                cell,
                fingerprint,
                error,
            } => {
                self.journal.append(
                    &JournalEntry::new(EntryKind::Skipped, &cell, None)
                        .detail(format!("fix-it {fingerprint}: delivery failed: {error}")),
                );
            }
            FixitOutcome::Unrouted {
                fingerprint,
                component,
            } => {
                self.journal.append(
                    &JournalEntry::new(EntryKind::Skipped, &component, None)
                        .detail(format!("fix-it {fingerprint}: no cell owns {component}")),
                );
            }
        }
    }

    /// Wake heartbeat cells whose interval has elapsed.
    fn heartbeat(&mut self, report: &mut TickReport, now: DateTime<Utc>) -> anyhow::Result<()> {
        let due: Vec<(String, u64)> = self
            .config
            .cells
            .iter()
            .filter_map(|(name, spec)| spec.heartbeat_secs.map(|s| (name.clone(), s)))
            .filter(|(name, secs)| {
                let interval =
                    chrono::Duration::seconds(i64::try_from(*secs).unwrap_or(i64::MAX / 1000));
                self.heartbeats
                    .get(name)
                    .is_none_or(|last| now - *last >= interval)
            })
            .collect();
        for (cell, _) in due {
            if self.running.contains_key(&cell) {
                continue;
            }
            let skip = match self.policy_skip(&cell)? {
                Some(reason) => Some(reason),
                None => {
                    if self.gates.breaker.allow(now).map_err(|e| escalate(e.into()))? {
                        if self.gates.quota.allow(&cell, now) {
                            None
                        } else {
                            Some(SkipReason::QuotaExhausted {
                                used: self.gates.quota.used(&cell, now),
                                limit: self.gates.quota.limit(),
                            })
                        }
                    } else {
                        Some(SkipReason::BreakerOpen)
                    }
                }
            };
            if let Some(reason) = skip {
                self.record_skip(report, &cell, None, reason);
                continue;
            }
            let request = WorkerRequest {
                cell: cell.clone(),
                message_id: None,
                prompt: worker::heartbeat_prompt(&cell),
                workdir: self.workdir(&cell),
                max_runtime: Duration::from_secs(self.config.worker.max_runtime_secs),
                max_turns: self.config.worker.max_turns,
            };
            if self.launch(&request, None, report, now)? {
                self.gates.breaker.record_dispatch(now).map_err(|e| escalate(e.into()))?;
                self.gates.quota.record(&cell, now).map_err(|e| escalate(e.into()))?;
                self.heartbeats.insert(cell, now);
                store::write_json(&self.paths.heartbeats(), &self.heartbeats)
                    .map_err(|e| escalate(e.into()))?;
            }
        }
        Ok(())
    }

    /// Refusals that don't depend on the gates: protected recipient, muted
    /// cell, kill switch.
    fn policy_skip(&self, cell: &str) -> anyhow::Result<Option<SkipReason>> {
        if self.config.daemon.is_protected(cell) {
            return Ok(Some(SkipReason::Protected));
        }
        if self.control.is_muted(cell).map_err(|e| escalate(e.into()))? {
            return Ok(Some(SkipReason::Muted));
        }
        if self.control.paused()?.is_some() {
            return Ok(Some(SkipReason::Paused));
        }
        Ok(None)
    }

    fn workdir(&self, cell: &str) -> Option<PathBuf> {
        self.mailboxes
            .directory()
            .resolve(cell)
            .and_then(|spec| spec.workdir.clone())
    }

    fn record_skip(
        &mut self,
        report: &mut TickReport,
        cell: &str,
        message_id: Option<u64>,
        reason: SkipReason,
    ) {
        let key = (cell.to_string(), message_id);
        if self.last_skip.get(&key) != Some(&reason) {
            tracing::warn!(cell, message_id = ?message_id, reason = %reason, "dispatch skipped");
            self.journal.append(
                &JournalEntry::new(EntryKind::Skipped, cell, message_id).detail(reason.to_string()),
            );
            self.bus.publish(&Event::DispatchSkipped {
                cell: cell.to_string(),
                message_id,
                reason: reason.to_string(),
            });
            self.last_skip.insert(key, reason.clone());
        }
        report.skipped.push(Skipped {
            cell: cell.to_string(),
            message_id,
            reason,
        });
    }

    /// Take the cell lock and spawn. Returns false when the lock is held;
    /// the caller tries again next tick.
    fn launch(
        &mut self,
        request: &WorkerRequest,
        message: Option<&Message>,
        report: &mut TickReport,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let cell = request.cell.as_str();
        match self
            .locks
            .try_acquire(&DispatchLock::new(cell, request.message_id, now))?
        {
            Acquire::Acquired => {}
            Acquire::Held(held) => {
                let reason = SkipReason::Locked {
                    pid: held.live_pid(),
                };
                self.record_skip(report, cell, request.message_id, reason);
                return Ok(false);
            }
        }
        // last look at the kill switch before anything is spawned
        if self.control.paused()?.is_some() {
            self.locks.release(cell)?;
            self.record_skip(report, cell, request.message_id, SkipReason::Paused);
            return Ok(false);
        }

        if let Some(message) = message
            && let Err(e) =
                self.with_busy_retry(|m| m.mark(cell, message.id, MessageStatus::Dispatching))
        {
            self.locks.release(cell)?;
            return Err(e.into());
        }

        let handle = match self.runner.spawn(request) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    cell,
                    message_id = ?request.message_id,
                    error = %format!("{e:#}"),
                    "failed to spawn worker"
                );
                let run = Running {
                    handle: Box::new(NeverStarted),
                    message_id: request.message_id,
                    started_at: now,
                };
                let finished = self.finish(
                    cell,
                    &run,
                    WorkerOutcome::Failure {
                        code: None,
                        detail: format!("spawn failed: {e}"),
                    },
                    now,
                )?;
                report.finished.push(finished);
                return Ok(false);
            }
        };
        let pid = handle.pid();
        self.locks.set_worker_pid(cell, pid)?;

        tracing::info!(cell, message_id = ?request.message_id, pid, "worker spawned");
        self.journal
            .append(&JournalEntry::new(EntryKind::Spawned, cell, request.message_id).pid(pid));
        self.bus.publish(&Event::DispatchStarted {
            cell: cell.to_string(),
            message_id: request.message_id,
            pid,
        });
        self.last_skip.retain(|(c, _), _| c != cell);
        self.running.insert(
            cell.to_string(),
            Running {
                handle,
                message_id: request.message_id,
                started_at: now,
            },
        );
        report.spawned.push(Dispatched {
            cell: cell.to_string(),
            message_id: request.message_id,
        });
        Ok(true)
    }

    /// Consider the cell's pending messages in arrival order; spawn for the
    /// first that passes every check.
    fn dispatch_cell(
        &mut self,
        cell: &str,
        report: &mut TickReport,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.with_busy_retry(|m| m.open_pending(cell))?;
        let pending = self.mailboxes.dispatchable(cell)?;
        if pending.is_empty() || self.running.contains_key(cell) {
            return Ok(());
        }

        for message in pending {
            if let Some(reason) = self.policy_skip(cell)? {
                self.record_skip(report, cell, Some(message.id), reason);
                continue;
            }
            let key = LimitKey::pair(&message.from_cell, &message.to_cell);
            let retry = message.dispatch_attempts > 0;
            if let Some(reason) = self
                .gates
                .check_dispatch(cell, &key, retry, now)
                .map_err(|e| escalate(e.into()))?
            {
                self.record_skip(report, cell, Some(message.id), reason);
                continue;
            }

            let request = WorkerRequest {
                cell: cell.to_string(),
                message_id: Some(message.id),
                prompt: worker::message_prompt(&message),
                workdir: self.workdir(cell),
                max_runtime: Duration::from_secs(self.config.worker.max_runtime_secs),
                max_turns: self.config.worker.max_turns,
            };
            if self.launch(&request, Some(&message), report, now)? {
                self.gates
                    .record_dispatch(cell, &key, retry, now)
                    .map_err(|e| escalate(e.into()))?;
            }
            // one worker per cell; the lock decides who goes next tick
            break;
        }
        Ok(())
    }

    /// Run until `stop` is set. Ticks on the poll interval, or early when an
    /// in-process delivery requests dispatch; finished workers are reaped
    /// in between.
    pub fn run(&mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        let wake = self.bus.subscribe_channel(|e| {
            matches!(
                e,
                Event::MessageDelivered {
                    dispatch_requested: true,
                    ..
                }
            )
        });
        let interval = self.config.daemon.poll_interval();
        let mut next_tick = Instant::now();

        while !stop.load(Ordering::SeqCst) {
            if Instant::now() >= next_tick {
                self.tick().context("daemon tick")?;
                // deliveries made by the tick itself don't need another one
                while wake.try_recv().is_ok() {}
                next_tick = Instant::now() + interval;
            }
            let wait = next_tick
                .saturating_duration_since(Instant::now())
                .min(REAP_INTERVAL);
            if wake.recv_timeout(wait).is_ok() {
                next_tick = Instant::now();
            }
            self.reap().context("reaping workers")?;
        }

        tracing::info!(
            running = self.running.len(),
            "daemon stopping; in-flight workers keep their locks"
        );
        Ok(())
    }

    /// Wait for every running worker to finish (each is bounded by the max
    /// runtime). Used by `--once`.
    pub fn drain(&mut self, stop: &AtomicBool) -> anyhow::Result<Vec<Finished>> {
        let mut finished = Vec::new();
        while !self.running.is_empty() && !stop.load(Ordering::SeqCst) {
            finished.extend(self.reap()?);
            if !self.running.is_empty() {
                std::thread::sleep(REAP_INTERVAL.min(Duration::from_millis(100)));
            }
        }
        Ok(finished)
    }

    pub fn state_root(&self) -> &Path {
        &self.paths.root
    }
}

/// Stand-in handle for a spawn that failed before a process existed.
struct NeverStarted;

impl WorkerHandle for NeverStarted {
    fn pid(&self) -> u32 {
        0
    }

    fn poll(&mut self) -> anyhow::Result<Option<WorkerOutcome>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::CellSpec;
    use crate::mailbox::{NewMessage, View};
    use crate::watcher;

    /// Hands out pre-scripted outcomes. A worker reports its outcome on the
    /// first poll after spawn.
    #[derive(Clone, Default)]
    struct ScriptedRunner {
        outcomes: Arc<Mutex<Vec<WorkerOutcome>>>,
        spawns: Arc<Mutex<Vec<WorkerRequest>>>,
        /// Outcome to use once the script runs out; `None` keeps workers
        /// running forever.
        fallback: Option<WorkerOutcome>,
    }

    impl ScriptedRunner {
        fn succeeding() -> Self {
            Self {
                fallback: Some(WorkerOutcome::Success),
                ..Self::default()
            }
        }

        fn script(outcomes: Vec<WorkerOutcome>) -> Self {
            let mut outcomes = outcomes;
            outcomes.reverse();
            Self {
                outcomes: Arc::new(Mutex::new(outcomes)),
                fallback: Some(WorkerOutcome::Success),
                ..Self::default()
            }
        }

        fn hanging() -> Self {
            Self::default()
        }

        fn spawn_count(&self) -> usize {
            self.spawns.lock().unwrap().len()
        }
    }

    struct ScriptedHandle {
        pid: u32,
        outcome: Option<WorkerOutcome>,
    }

    impl WorkerHandle for ScriptedHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn poll(&mut self) -> anyhow::Result<Option<WorkerOutcome>> {
            Ok(self.outcome.clone())
        }
    }

    impl WorkerRunner for ScriptedRunner {
        fn spawn(&self, request: &WorkerRequest) -> anyhow::Result<Box<dyn WorkerHandle>> {
            let mut spawns = self.spawns.lock().unwrap();
            spawns.push(request.clone());
            let outcome = self.outcomes.lock().unwrap().pop().or_else(|| self.fallback.clone());
            Ok(Box::new(ScriptedHandle {
                // our own pid reads as alive to the stale sweep
                pid: std::process::id(),
                outcome,
            }))
        }
    }

    fn config(state: &Path) -> Config {
        let mut config = Config::parse_toml(r#"version = "1""#).unwrap();
        config.state_dir = Some(state.to_path_buf());
        config.daemon.protected = vec!["queen".into()];
        config.daemon.daily_quota = 100;
        config.limiter.max_attempts = 100;
        config.breaker.trip_threshold = 100;
        config.cells.insert("queen".into(), CellSpec::default());
        config.cells.insert("drone".into(), CellSpec::default());
        config.cells.insert("scout".into(), CellSpec::default());
        config
    }

    fn daemon(config: Config, runner: &ScriptedRunner) -> Daemon {
        let paths = StatePaths::new(config.state_root());
        Daemon::with_runner(config, paths, EventBus::new(), Box::new(runner.clone())).unwrap()
    }

    fn send(d: &Daemon, to: &str, subject: &str) -> u64 {
        d.mailboxes()
            .deliver(NewMessage::new("queen", to, subject, "do it").dispatch(true))
            .unwrap()
    }

    fn status(d: &Daemon, cell: &str, id: u64) -> MessageStatus {
        d.mailboxes().get(cell, id).unwrap().status
    }

    #[test]
    fn dispatches_and_closes_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        let id = send(&d, "drone", "task");

        let report = d.tick().unwrap();
        assert_eq!(report.spawned.len(), 1);
        assert_eq!(status(&d, "drone", id), MessageStatus::Dispatching);
        assert!(d.locks.get("drone").unwrap().is_some());

        let report = d.tick().unwrap();
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].status, Some(MessageStatus::Closed));
        assert_eq!(status(&d, "drone", id), MessageStatus::Closed);
        assert!(d.locks.get("drone").unwrap().is_none());
        assert_eq!(runner.spawn_count(), 1);
    }

    #[test]
    fn plain_mail_is_never_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        let id = d
            .mailboxes()
            .deliver(NewMessage::new("queen", "drone", "fyi", "nothing to do"))
            .unwrap();
        d.tick().unwrap();
        assert_eq!(runner.spawn_count(), 0);
        assert_eq!(status(&d, "drone", id), MessageStatus::Unread);
    }

    #[test]
    fn protected_cells_never_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        let id = d
            .mailboxes()
            .deliver(NewMessage::new("drone", "queen", "report", "done").dispatch(true))
            .unwrap();
        for _ in 0..3 {
            let report = d.tick().unwrap();
            assert!(report.skipped.iter().any(|s| s.reason == SkipReason::Protected));
        }
        assert_eq!(runner.spawn_count(), 0);
        assert_eq!(status(&d, "queen", id), MessageStatus::Opened);
        // journaled once, not every tick
        let skips = d
            .journal
            .read_last(100)
            .into_iter()
            .filter(|e| e.kind == EntryKind::Skipped)
            .count();
        assert_eq!(skips, 1);
    }

    #[test]
    fn one_worker_per_cell_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::hanging();
        let mut d = daemon(config(dir.path()), &runner);
        let first = send(&d, "drone", "first");
        let second = send(&d, "drone", "second");
        let other = send(&d, "scout", "elsewhere");

        for _ in 0..3 {
            d.tick().unwrap();
        }
        assert_eq!(runner.spawn_count(), 2, "one per cell");
        assert_eq!(status(&d, "drone", first), MessageStatus::Dispatching);
        assert_eq!(status(&d, "drone", second), MessageStatus::Opened);
        assert_eq!(status(&d, "scout", other), MessageStatus::Dispatching);
        assert_eq!(d.running_cells(), vec!["drone", "scout"]);
    }

    #[test]
    fn daily_quota_caps_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.daemon.daily_quota = 3;
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config, &runner);
        let ids: Vec<u64> = (0..10).map(|i| send(&d, "drone", &format!("m{i}"))).collect();

        for _ in 0..12 {
            d.tick().unwrap();
        }
        assert_eq!(runner.spawn_count(), 3);
        let opened = ids
            .iter()
            .filter(|id| status(&d, "drone", **id) == MessageStatus::Opened)
            .count();
        assert_eq!(opened, 7);
        let report = d.tick().unwrap();
        assert!(matches!(
            report.skipped[0].reason,
            SkipReason::QuotaExhausted { used: 3, limit: 3 }
        ));
    }

    #[test]
    fn timeout_retries_once_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::script(vec![WorkerOutcome::Timeout, WorkerOutcome::Timeout]);
        let mut d = daemon(config(dir.path()), &runner);
        let id = send(&d, "drone", "slow");

        d.tick().unwrap(); // spawn 1
        let report = d.tick().unwrap(); // reap: reopened, spawn 2
        assert_eq!(report.finished[0].status, Some(MessageStatus::Opened));
        assert_eq!(report.spawned.len(), 1);

        let report = d.tick().unwrap(); // reap: closed
        assert_eq!(report.finished[0].status, Some(MessageStatus::Closed));
        let message = d.mailboxes().get("drone", id).unwrap();
        assert_eq!(message.status, MessageStatus::Closed);
        assert_eq!(message.dispatch_attempts, 2);
        assert!(message.failure.unwrap().contains("timed out"));

        for _ in 0..3 {
            d.tick().unwrap();
        }
        assert_eq!(runner.spawn_count(), 2, "no third attempt");
    }

    #[test]
    fn retry_does_not_consume_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.daemon.daily_quota = 1;
        let runner = ScriptedRunner::script(vec![WorkerOutcome::Failure {
            code: Some(1),
            detail: "worker exited with code 1".into(),
        }]);
        let mut d = daemon(config, &runner);
        let id = send(&d, "drone", "flaky");
        d.tick().unwrap();
        d.tick().unwrap();
        d.tick().unwrap();
        assert_eq!(runner.spawn_count(), 2);
        assert_eq!(status(&d, "drone", id), MessageStatus::Closed);
        assert!(d.mailboxes().get("drone", id).unwrap().failure.is_some());
    }

    #[test]
    fn failure_with_visible_progress_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::script(vec![WorkerOutcome::Timeout]);
        let mut d = daemon(config(dir.path()), &runner);
        let id = send(&d, "drone", "long job");
        d.tick().unwrap();
        // the worker reported back before it was cut off
        d.mailboxes()
            .deliver(NewMessage::new("drone", "queen", "partial", "half done"))
            .unwrap();
        let report = d.tick().unwrap();
        assert_eq!(report.finished[0].status, Some(MessageStatus::Closed));
        assert_eq!(runner.spawn_count(), 1);
        assert_eq!(status(&d, "drone", id), MessageStatus::Closed);
    }

    #[test]
    fn kill_switch_blocks_spawns_but_keeps_polling() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        d.control.pause(Some("maintenance".into())).unwrap();
        let id = send(&d, "drone", "task");

        let report = d.tick().unwrap();
        assert_eq!(runner.spawn_count(), 0);
        assert_eq!(report.skipped[0].reason, SkipReason::Paused);
        assert_eq!(status(&d, "drone", id), MessageStatus::Opened);

        d.control.resume().unwrap();
        d.tick().unwrap();
        assert_eq!(runner.spawn_count(), 1);
    }

    #[test]
    fn muted_cell_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        d.control.set_muted("drone", true).unwrap();
        send(&d, "drone", "task");
        send(&d, "scout", "task");
        let report = d.tick().unwrap();
        assert_eq!(runner.spawn_count(), 1);
        assert_eq!(report.spawned[0].cell, "scout");
        assert_eq!(report.skipped[0].reason, SkipReason::Muted);
    }

    #[test]
    fn held_lock_is_a_skip_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        let mut foreign = DispatchLock::new("drone", None, Utc::now());
        foreign.worker_pid = Some(std::process::id());
        d.locks.try_acquire(&foreign).unwrap();
        let id = send(&d, "drone", "task");

        let report = d.tick().unwrap();
        assert!(matches!(report.skipped[0].reason, SkipReason::Locked { .. }));
        assert_eq!(status(&d, "drone", id), MessageStatus::Opened);
        assert_eq!(runner.spawn_count(), 0);
    }

    #[test]
    fn stale_lock_is_reclaimed_and_message_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::hanging();
        let mut d = daemon(config(dir.path()), &runner);
        let id = send(&d, "drone", "task");
        d.mailboxes().open_pending("drone").unwrap();
        d.mailboxes().mark("drone", id, MessageStatus::Dispatching).unwrap();

        // a crashed daemon's lock: old, and its pid is gone
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        let mut lock = DispatchLock::new("drone", Some(id), two_hours_ago);
        lock.owner_pid = 3_999_999;
        d.locks.try_acquire(&lock).unwrap();

        let report = d.tick().unwrap();
        assert_eq!(report.recovered.len(), 1);
        assert_eq!(report.spawned.len(), 1);
        assert_eq!(status(&d, "drone", id), MessageStatus::Dispatching);
        assert_eq!(d.mailboxes().get("drone", id).unwrap().dispatch_attempts, 2);
    }

    #[test]
    fn heartbeat_wakes_idle_cell_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cells.insert(
            "scout".into(),
            CellSpec {
                heartbeat_secs: Some(600),
                ..CellSpec::default()
            },
        );
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config, &runner);
        let start = Utc::now();

        let report = d.tick_at(start).unwrap();
        assert_eq!(
            report.spawned,
            vec![Dispatched {
                cell: "scout".into(),
                message_id: None
            }]
        );
        d.tick_at(start + chrono::Duration::seconds(60)).unwrap();
        assert_eq!(runner.spawn_count(), 1);
        d.tick_at(start + chrono::Duration::seconds(601)).unwrap();
        assert_eq!(runner.spawn_count(), 2);
        assert!(runner.spawns.lock().unwrap()[0].prompt.contains("heartbeat"));
    }

    #[test]
    fn repeated_log_error_becomes_fixit_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("drone.log");
        std::fs::write(&log, "").unwrap();
        let mut config = config(dir.path());
        config.cells.insert(
            "drone".into(),
            CellSpec {
                logs: vec![log.clone()],
                ..CellSpec::default()
            },
        );
        let runner = ScriptedRunner::hanging();
        let mut d = daemon(config, &runner);
        d.tick().unwrap(); // start tailing

        let append = |line: &str| {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            writeln!(f, "{line}").unwrap();
        };
        append("TypeError: x is None");
        let report = d.tick().unwrap();
        assert!(report.fixits.is_empty(), "first occurrence is silent");
        assert_eq!(runner.spawn_count(), 0);

        append("TypeError: x is None");
        let report = d.tick().unwrap();
        assert_eq!(report.fixits.len(), 1);
        let id = report.fixits[0].message_id.unwrap();
        let message = d.mailboxes().get("drone", id).unwrap();
        assert!(message.dispatch_requested);
        assert_eq!(message.from_cell, watcher::WATCHER_SENDER);
        assert_eq!(runner.spawn_count(), 1);
        assert_eq!(d.mailboxes().list("drone", View::Inbox).unwrap().len(), 1);
    }

    #[test]
    fn burst_of_one_error_delivers_a_single_fixit() {
        let dir = tempfile::tempdir().unwrap();
        // not there yet when the daemon starts watching
        let log = dir.path().join("drone.log");
        let mut config = config(dir.path());
        config.cells.insert(
            "drone".into(),
            CellSpec {
                logs: vec![log.clone()],
                ..CellSpec::default()
            },
        );
        let runner = ScriptedRunner::hanging();
        let mut d = daemon(config, &runner);
        d.tick().unwrap();

        std::fs::write(&log, "TypeError: x is None\n".repeat(5)).unwrap();
        let report = d.tick().unwrap();
        assert_eq!(report.fixits.len(), 1);

        std::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"TypeError: x is None\n"))
            .unwrap();
        let report = d.tick().unwrap();
        assert!(report.fixits.is_empty());

        let fixits: Vec<Message> = d
            .mailboxes()
            .list("drone", View::Inbox)
            .unwrap()
            .into_iter()
            .filter(|m| m.from_cell == watcher::WATCHER_SENDER)
            .collect();
        assert_eq!(fixits.len(), 1);
        let errors = d.registry().query(None, None).unwrap();
        assert_eq!(errors[0].count, 6);
        assert!(!errors[0].fixit_pending);
    }

    #[test]
    fn refused_fixit_is_delivered_once_the_breaker_closes() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("drone.log");
        std::fs::write(&log, "").unwrap();
        let mut config = config(dir.path());
        config.breaker.trip_threshold = 1;
        config.cells.insert(
            "drone".into(),
            CellSpec {
                logs: vec![log.clone()],
                ..CellSpec::default()
            },
        );
        let runner = ScriptedRunner::hanging();
        let mut d = daemon(config, &runner);
        let start = Utc::now();
        d.tick_at(start).unwrap();

        // two sightings trip the breaker before the fix-it can go out
        std::fs::write(&log, "TypeError: x is None\nTypeError: x is None\n").unwrap();
        let report = d.tick_at(start).unwrap();
        assert!(report.fixits.is_empty());
        assert!(
            report
                .skipped
                .iter()
                .any(|s| s.cell == "drone" && s.reason == SkipReason::BreakerOpen)
        );
        assert_eq!(d.registry().pending_fixits().unwrap().len(), 1);

        // past the cooldown, no new log lines: the kept request goes out
        let later = start + chrono::Duration::seconds(301);
        let report = d.tick_at(later).unwrap();
        assert_eq!(report.fixits.len(), 1);
        assert!(d.registry().pending_fixits().unwrap().is_empty());
    }

    #[test]
    fn breaker_storm_stops_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.breaker.trip_threshold = 2;
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config, &runner);
        for cell in ["drone", "scout"] {
            send(&d, cell, "a");
            send(&d, cell, "b");
        }
        for _ in 0..6 {
            d.tick().unwrap();
        }
        assert_eq!(d.gates().breaker.snapshot().state, crate::gate::BreakerState::Open);
        assert_eq!(runner.spawn_count(), 3);
    }

    #[test]
    fn second_daemon_on_same_state_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let _first = daemon(config(dir.path()), &runner);
        let paths = StatePaths::new(dir.path());
        let err = Daemon::with_runner(
            config(dir.path()),
            paths,
            EventBus::new(),
            Box::new(runner.clone()),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn corrupt_mailbox_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        let inbox = dir.path().join("mailboxes/drone/inbox.json");
        std::fs::create_dir_all(inbox.parent().unwrap()).unwrap();
        std::fs::write(&inbox, "{ truncated").unwrap();
        let err = d.tick().unwrap_err();
        assert!(is_fatal(&err), "{err:#}");
    }

    #[test]
    fn stop_flag_ends_run_loop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::succeeding();
        let mut d = daemon(config(dir.path()), &runner);
        let stop = AtomicBool::new(true);
        d.run(&stop).unwrap();
        let stop = AtomicBool::new(false);
        assert!(d.drain(&stop).unwrap().is_empty());
    }
}
