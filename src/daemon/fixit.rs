//! Fix-it routing.
//!
//! An error whose count crossed the dispatch threshold stays pending in the
//! registry until a fix-it message is in its owning cell's inbox. A request
//! the gates refuse is kept and tried again on the next pass.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CellDirectory;
use crate::error::{MailboxError, StoreError};
use crate::gate::{Gates, SkipReason};
use crate::mailbox::MailboxStore;
use crate::registry::{ErrorFingerprint, ErrorRegistry};
use crate::store;
use crate::watcher;

const BUSY_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixitOutcome {
    Delivered {
        cell: String,
        fingerprint: String,
        message_id: u64,
    },
    Refused {
        cell: String,
        fingerprint: String,
        reason: SkipReason,
    },
    /// Delivery failed; the request stays pending.
    Failed {
        cell: String,
        fingerprint: String,
        error: String,
    },
    /// No configured cell owns the error. The request is dropped.
    Unrouted {
        fingerprint: String,
        component: String,
    },
}

/// The cell a fix-it for `error` goes to: the cell whose log surfaced it,
/// else a cell named like its component.
pub fn owner_cell(error: &ErrorFingerprint, directory: &CellDirectory) -> Option<String> {
    error
        .owner
        .iter()
        .chain(std::iter::once(&error.component))
        .find(|cell| directory.contains(cell))
        .cloned()
}

/// Deliver every pending fix-it the gates allow, at most one per error.
/// Corrupt state aborts the pass; other delivery failures are reported and
/// retried later.
pub fn route_pending(
    registry: &ErrorRegistry,
    gates: &mut Gates,
    mailboxes: &MailboxStore,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<FixitOutcome>> {
    let mut outcomes = Vec::new();
    for error in registry.pending_fixits()? {
        let fingerprint = error.fingerprint.clone();
        let Some(cell) = owner_cell(&error, mailboxes.directory()) else {
            tracing::warn!(
                fingerprint = %fingerprint,
                component = %error.component,
                "no cell owns this error, dropping fix-it request"
            );
            registry.clear_fixit(&fingerprint)?;
            outcomes.push(FixitOutcome::Unrouted {
                fingerprint,
                component: error.component,
            });
            continue;
        };

        if let Some(reason) = gates.check_fixit(&fingerprint, now)? {
            outcomes.push(FixitOutcome::Refused {
                cell,
                fingerprint,
                reason,
            });
            continue;
        }

        let message = watcher::fixit_message(&cell, &error);
        let delivered = store::retry_transient(BUSY_RETRIES, MailboxError::is_transient, || {
            mailboxes.deliver(message.clone())
        });
        let message_id = match delivered {
            Ok(id) => id,
            Err(e @ MailboxError::Store(StoreError::Corrupt { .. })) => return Err(e.into()),
            Err(e) => {
                tracing::error!(
                    cell = %cell,
                    fingerprint = %fingerprint,
                    error = %e,
                    "fix-it delivery failed"
                );
                outcomes.push(FixitOutcome::Failed {
                    cell,
                    fingerprint,
                    error: e.to_string(),
                });
                continue;
            }
        };
        gates.record_fixit(&fingerprint, now)?;
        registry.clear_fixit(&fingerprint)?;
        tracing::info!(
            cell = %cell,
            message_id,
            fingerprint = %fingerprint,
            count = error.count,
            "fix-it delivered"
        );
        outcomes.push(FixitOutcome::Delivered {
            cell,
            fingerprint,
            message_id,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::{CellSpec, Config};
    use crate::events::EventBus;
    use crate::mailbox::{MessageStatus, View};
    use crate::registry::Sighting;

    struct Setup {
        _dir: tempfile::TempDir,
        registry: ErrorRegistry,
        gates: Gates,
        mailboxes: MailboxStore,
    }

    fn setup(limiter_max: u32) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::parse_toml("version = \"1\"\n[cells.drone]\n").unwrap();
        config.limiter.max_attempts = limiter_max;
        let bus = EventBus::new();
        let registry =
            ErrorRegistry::new(dir.path().join("registry"), config.registry.clone(), bus.clone());
        let gates = Gates::load(&dir.path().join("gates"), &config, bus.clone()).unwrap();
        let mut cells = BTreeMap::new();
        cells.insert("drone".to_string(), CellSpec::default());
        let mailboxes =
            MailboxStore::new(dir.path().join("mailboxes"), CellDirectory::new(cells), bus);
        Setup {
            _dir: dir,
            registry,
            gates,
            mailboxes,
        }
    }

    fn report_twice(registry: &ErrorRegistry, sighting: &Sighting) -> String {
        registry.report(sighting).unwrap();
        registry.report(sighting).unwrap().fingerprint
    }

    #[test]
    fn pending_error_becomes_one_opened_fixit() {
        let mut s = setup(3);
        let fp = report_twice(&s.registry, &Sighting::new("TypeError", "x is None", "drone"));
        let now = Utc::now();

        let outcomes = route_pending(&s.registry, &mut s.gates, &s.mailboxes, now).unwrap();
        match &outcomes[..] {
            [FixitOutcome::Delivered {
                cell, fingerprint, ..
            }] => {
                assert_eq!(cell, "drone");
                assert_eq!(*fingerprint, fp);
            }
            other => panic!("expected one delivery, got {other:?}"),
        }
        let inbox = s.mailboxes.list("drone", View::Inbox).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].status, MessageStatus::Opened);
        assert!(inbox[0].dispatch_requested);

        // nothing left to route
        assert!(route_pending(&s.registry, &mut s.gates, &s.mailboxes, now).unwrap().is_empty());
    }

    #[test]
    fn refused_request_is_kept_for_later() {
        let mut s = setup(1);
        let now = Utc::now();
        let fp = report_twice(&s.registry, &Sighting::new("E", "boom", "drone"));
        s.gates.record_fixit(&fp, now).unwrap();

        let outcomes = route_pending(&s.registry, &mut s.gates, &s.mailboxes, now).unwrap();
        assert!(matches!(&outcomes[..], [FixitOutcome::Refused { .. }]));
        assert!(s.mailboxes.list("drone", View::Inbox).unwrap().is_empty());
        assert_eq!(s.registry.pending_fixits().unwrap().len(), 1);

        let later = now + chrono::Duration::hours(3);
        let outcomes = route_pending(&s.registry, &mut s.gates, &s.mailboxes, later).unwrap();
        assert!(matches!(&outcomes[..], [FixitOutcome::Delivered { .. }]));
        assert!(s.registry.pending_fixits().unwrap().is_empty());
    }

    #[test]
    fn error_from_unknown_component_is_dropped() {
        let mut s = setup(3);
        report_twice(&s.registry, &Sighting::new("E", "boom", "billing"));
        let outcomes = route_pending(&s.registry, &mut s.gates, &s.mailboxes, Utc::now()).unwrap();
        assert!(matches!(
            &outcomes[..],
            [FixitOutcome::Unrouted { component, .. }] if component == "billing"
        ));
        assert!(s.registry.pending_fixits().unwrap().is_empty());
    }

    #[test]
    fn owner_wins_over_component() {
        let mut cells = BTreeMap::new();
        cells.insert("drone".to_string(), CellSpec::default());
        cells.insert("api".to_string(), CellSpec::default());
        let directory = CellDirectory::new(cells);
        let dir = tempfile::tempdir().unwrap();
        let registry = ErrorRegistry::new(dir.path(), Default::default(), EventBus::new());
        let fp = registry
            .report(&Sighting::new("E", "boom", "api").owner("drone"))
            .unwrap()
            .fingerprint;
        let error = registry.get(&fp).unwrap().unwrap();
        assert_eq!(owner_cell(&error, &directory).as_deref(), Some("drone"));
    }
}
