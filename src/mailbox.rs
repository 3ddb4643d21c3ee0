//! Per-cell persisted message queues.
//!
//! Layout: `<root>/<cell>/{inbox,sent,archive}.json` plus a `seq` counter and
//! a `.lock` file. Every mutation runs under the cell's lock; reads don't
//! need it because writes replace whole files atomically.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{CellDirectory, validate_cell_name};
use crate::error::{MailboxError, StoreError};
use crate::events::{Event, EventBus};
use crate::store::{self, LockGuard};

/// Schema version stamped on every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Opened,
    Dispatching,
    Closed,
    Archived,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Unread => "unread",
            MessageStatus::Opened => "opened",
            MessageStatus::Dispatching => "dispatching",
            MessageStatus::Closed => "closed",
            MessageStatus::Archived => "archived",
        }
    }

    /// Whether the lifecycle allows `self -> to`. Archival is handled by
    /// [`MailboxStore::archive`], which moves the record between views.
    pub fn can_become(self, to: MessageStatus) -> bool {
        use MessageStatus::{Archived, Closed, Dispatching, Opened, Unread};
        match (self, to) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Unread, Opened) | (Opened, Dispatching) => true,
            // completion, or reset for a retry / stale recovery
            (Dispatching, Closed | Opened) => true,
            // operator closes without dispatch
            (Unread | Opened, Closed) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum View {
    Inbox,
    Sent,
    Archive,
}

impl View {
    fn file_name(self) -> &'static str {
        match self {
            View::Inbox => "inbox.json",
            View::Sent => "sent.json",
            View::Archive => "archive.json",
        }
    }
}

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "schema_version")]
    pub v: u32,
    pub id: u64,
    pub from_cell: String,
    pub to_cell: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default)]
    pub dispatch_requested: bool,
    #[serde(default)]
    pub reply_to_cell: Option<String>,
    /// Number of times a worker was spawned for this message.
    #[serde(default)]
    pub dispatch_attempts: u32,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Why the last dispatch failed, if it did.
    #[serde(default)]
    pub failure: Option<String>,
}

/// Apply a lifecycle step to one record. Only a message that asked for
/// dispatch may enter `dispatching`.
fn transition(
    m: &mut Message,
    status: MessageStatus,
    now: DateTime<Utc>,
) -> Result<(), MailboxError> {
    let allowed = m.status.can_become(status)
        && !(status == MessageStatus::Dispatching && !m.dispatch_requested);
    if !allowed {
        return Err(MailboxError::InvalidTransition {
            cell: m.to_cell.clone(),
            id: m.id,
            from: m.status.to_string(),
            to: status.to_string(),
        });
    }
    if m.status == status {
        return Ok(());
    }
    match status {
        MessageStatus::Dispatching => {
            m.dispatch_attempts += 1;
            m.dispatched_at = Some(now);
        }
        MessageStatus::Closed => m.closed_at = Some(now),
        _ => {}
    }
    m.status = status;
    Ok(())
}

/// A message about to be delivered.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_cell: String,
    pub to_cell: String,
    pub subject: String,
    pub body: String,
    pub dispatch_requested: bool,
    pub reply_to_cell: Option<String>,
    /// Fix-it messages raised by the watcher arrive already opened.
    pub initial_status: MessageStatus,
}

impl NewMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from_cell: from.into(),
            to_cell: to.into(),
            subject: subject.into(),
            body: body.into(),
            dispatch_requested: false,
            reply_to_cell: None,
            initial_status: MessageStatus::Unread,
        }
    }

    pub fn dispatch(mut self, requested: bool) -> Self {
        self.dispatch_requested = requested;
        self
    }

    pub fn reply_to(mut self, cell: Option<String>) -> Self {
        self.reply_to_cell = cell;
        self
    }

    pub fn opened(mut self) -> Self {
        self.initial_status = MessageStatus::Opened;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ViewFile {
    schema_version: u32,
    messages: Vec<Message>,
}

impl Default for ViewFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailboxCounts {
    pub unread: usize,
    pub opened: usize,
    pub dispatching: usize,
    pub closed: usize,
    pub archived: usize,
}

#[derive(Debug, Clone)]
pub struct MailboxStore {
    root: PathBuf,
    directory: CellDirectory,
    bus: Arc<EventBus>,
    lock_timeout: Duration,
}

impl MailboxStore {
    pub fn new(root: impl Into<PathBuf>, directory: CellDirectory, bus: Arc<EventBus>) -> Self {
        Self {
            root: root.into(),
            directory,
            bus,
            lock_timeout: store::DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn directory(&self) -> &CellDirectory {
        &self.directory
    }

    pub fn cells(&self) -> Vec<String> {
        self.directory.names().map(str::to_string).collect()
    }

    fn cell_dir(&self, cell: &str) -> PathBuf {
        self.root.join(cell)
    }

    fn view_path(&self, cell: &str, view: View) -> PathBuf {
        self.cell_dir(cell).join(view.file_name())
    }

    fn lock(&self, cell: &str) -> Result<LockGuard, MailboxError> {
        LockGuard::acquire(&self.cell_dir(cell).join(".lock"), self.lock_timeout).map_err(
            |e| match e {
                StoreError::LockTimeout { .. } => MailboxError::MailboxBusy {
                    cell: cell.to_string(),
                },
                other => MailboxError::Store(other),
            },
        )
    }

    fn known(&self, cell: &str) -> Result<(), MailboxError> {
        validate_cell_name(cell)?;
        if self.directory.contains(cell) {
            Ok(())
        } else {
            Err(MailboxError::UnknownRecipient(cell.to_string()))
        }
    }

    fn load(&self, cell: &str, view: View) -> Result<ViewFile, MailboxError> {
        Ok(store::read_json_or_default(&self.view_path(cell, view))?)
    }

    fn save(&self, cell: &str, view: View, file: &ViewFile) -> Result<(), MailboxError> {
        Ok(store::write_json(&self.view_path(cell, view), file)?)
    }

    fn next_id(&self, cell: &str) -> Result<u64, MailboxError> {
        let path = self.cell_dir(cell).join("seq");
        let current: u64 = store::read_json(&path)?.unwrap_or(0);
        let next = current + 1;
        store::write_json(&path, &next)?;
        Ok(next)
    }

    /// Deliver a message into the recipient's inbox and return its id.
    ///
    /// Delivery never depends on the recipient's worker being idle. Fails
    /// with `UnknownRecipient` for cells not in the directory and
    /// `MailboxBusy` when the cell lock can't be taken in time; callers
    /// retry the latter.
    pub fn deliver(&self, msg: NewMessage) -> Result<u64, MailboxError> {
        if msg.from_cell.trim().is_empty() {
            return Err(MailboxError::Malformed("sender is empty".into()));
        }
        if msg.subject.trim().is_empty() && msg.body.trim().is_empty() {
            return Err(MailboxError::Malformed(
                "message has neither subject nor body".into(),
            ));
        }
        if !matches!(
            msg.initial_status,
            MessageStatus::Unread | MessageStatus::Opened
        ) {
            return Err(MailboxError::Malformed(format!(
                "cannot deliver a message as {}",
                msg.initial_status
            )));
        }
        self.known(&msg.to_cell)?;
        if let Some(reply_to) = &msg.reply_to_cell {
            validate_cell_name(reply_to)?;
        }

        let message = {
            let _guard = self.lock(&msg.to_cell)?;
            let id = self.next_id(&msg.to_cell)?;
            let message = Message {
                v: SCHEMA_VERSION,
                id,
                from_cell: msg.from_cell.clone(),
                to_cell: msg.to_cell.clone(),
                subject: msg.subject,
                body: msg.body,
                created_at: Utc::now(),
                status: msg.initial_status,
                dispatch_requested: msg.dispatch_requested,
                reply_to_cell: msg.reply_to_cell,
                dispatch_attempts: 0,
                dispatched_at: None,
                closed_at: None,
                failure: None,
            };
            let mut inbox = self.load(&msg.to_cell, View::Inbox)?;
            inbox.messages.push(message.clone());
            self.save(&msg.to_cell, View::Inbox, &inbox)?;
            message
        };

        // The sender's copy is informational; the recipient's inbox owns it.
        if message.from_cell != message.to_cell && self.directory.contains(&message.from_cell) {
            let _guard = self.lock(&message.from_cell)?;
            let mut sent = self.load(&message.from_cell, View::Sent)?;
            sent.messages.push(message.clone());
            self.save(&message.from_cell, View::Sent, &sent)?;
        }

        tracing::debug!(
            cell = %message.to_cell,
            id = message.id,
            from = %message.from_cell,
            dispatch_requested = message.dispatch_requested,
            "delivered"
        );
        self.bus.publish(&Event::MessageDelivered {
            cell: message.to_cell.clone(),
            id: message.id,
            from: message.from_cell.clone(),
            dispatch_requested: message.dispatch_requested,
        });
        if message.status == MessageStatus::Opened {
            self.bus.publish(&Event::MessageOpened {
                cell: message.to_cell.clone(),
                id: message.id,
            });
        }
        Ok(message.id)
    }

    /// Messages in one view, in arrival order.
    pub fn list(&self, cell: &str, view: View) -> Result<Vec<Message>, MailboxError> {
        self.known(cell)?;
        let mut messages = self.load(cell, view)?.messages;
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    /// Look a message up in the inbox, then the archive.
    pub fn get(&self, cell: &str, id: u64) -> Result<Message, MailboxError> {
        self.known(cell)?;
        for view in [View::Inbox, View::Archive] {
            if let Some(m) = self.load(cell, view)?.messages.into_iter().find(|m| m.id == id) {
                return Ok(m);
            }
        }
        Err(MailboxError::UnknownMessage {
            cell: cell.to_string(),
            id,
        })
    }

    /// Return a message, marking it opened if this is its first read.
    pub fn read(&self, cell: &str, id: u64) -> Result<Message, MailboxError> {
        let current = self.get(cell, id)?;
        if current.status == MessageStatus::Unread {
            return self.mark(cell, id, MessageStatus::Opened);
        }
        Ok(current)
    }

    /// Locked read-modify-write of a single inbox record.
    fn modify<F>(&self, cell: &str, id: u64, f: F) -> Result<Message, MailboxError>
    where
        F: FnOnce(&mut Message) -> Result<(), MailboxError>,
    {
        self.known(cell)?;
        let _guard = self.lock(cell)?;
        let mut inbox = self.load(cell, View::Inbox)?;
        let Some(message) = inbox.messages.iter_mut().find(|m| m.id == id) else {
            if self.load(cell, View::Archive)?.messages.iter().any(|m| m.id == id) {
                return Err(MailboxError::Archived {
                    cell: cell.to_string(),
                    id,
                });
            }
            return Err(MailboxError::UnknownMessage {
                cell: cell.to_string(),
                id,
            });
        };
        f(message)?;
        let updated = message.clone();
        self.save(cell, View::Inbox, &inbox)?;
        Ok(updated)
    }

    /// Move a message to `status`, enforcing the lifecycle.
    pub fn mark(
        &self,
        cell: &str,
        id: u64,
        status: MessageStatus,
    ) -> Result<Message, MailboxError> {
        if status == MessageStatus::Archived {
            return self.archive(cell, id);
        }
        let updated = self.modify(cell, id, |m| transition(m, status, Utc::now()))?;
        if status == MessageStatus::Opened {
            self.bus.publish(&Event::MessageOpened {
                cell: cell.to_string(),
                id,
            });
        }
        Ok(updated)
    }

    /// Close a message, recording why when it failed. Status and failure
    /// are written together.
    pub fn close(
        &self,
        cell: &str,
        id: u64,
        failure: Option<String>,
    ) -> Result<Message, MailboxError> {
        self.modify(cell, id, move |m| {
            transition(m, MessageStatus::Closed, Utc::now())?;
            if failure.is_some() {
                m.failure = failure;
            }
            Ok(())
        })
    }

    /// Return a `dispatching` message to `opened` for one more attempt,
    /// keeping the failure that caused it for the record.
    pub fn reopen(
        &self,
        cell: &str,
        id: u64,
        failure: Option<String>,
    ) -> Result<Message, MailboxError> {
        let updated = self.modify(cell, id, |m| {
            if m.status != MessageStatus::Dispatching {
                return Err(MailboxError::InvalidTransition {
                    cell: m.to_cell.clone(),
                    id: m.id,
                    from: m.status.to_string(),
                    to: MessageStatus::Opened.to_string(),
                });
            }
            m.status = MessageStatus::Opened;
            m.failure = failure;
            Ok(())
        })?;
        self.bus.publish(&Event::MessageOpened {
            cell: cell.to_string(),
            id,
        });
        Ok(updated)
    }

    /// Move a message from the inbox to the archive. Terminal; nothing is
    /// ever deleted.
    pub fn archive(&self, cell: &str, id: u64) -> Result<Message, MailboxError> {
        self.known(cell)?;
        let archived = {
            let _guard = self.lock(cell)?;
            let mut inbox = self.load(cell, View::Inbox)?;
            let mut archive = self.load(cell, View::Archive)?;
            let Some(pos) = inbox.messages.iter().position(|m| m.id == id) else {
                if archive.messages.iter().any(|m| m.id == id) {
                    return Err(MailboxError::Archived {
                        cell: cell.to_string(),
                        id,
                    });
                }
                return Err(MailboxError::UnknownMessage {
                    cell: cell.to_string(),
                    id,
                });
            };
            let mut message = inbox.messages.remove(pos);
            message.status = MessageStatus::Archived;
            archive.messages.push(message.clone());
            // archive first: a crash between the writes leaves a duplicate,
            // never a loss
            self.save(cell, View::Archive, &archive)?;
            self.save(cell, View::Inbox, &inbox)?;
            message
        };
        self.bus.publish(&Event::MessageArchived {
            cell: cell.to_string(),
            id,
        });
        Ok(archived)
    }

    /// Open every unread, dispatch-requested message in a cell. Returns the
    /// ids that changed.
    pub fn open_pending(&self, cell: &str) -> Result<Vec<u64>, MailboxError> {
        self.known(cell)?;
        let pending: Vec<u64> = self
            .load(cell, View::Inbox)?
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Unread && m.dispatch_requested)
            .map(|m| m.id)
            .collect();
        if pending.is_empty() {
            return Ok(pending);
        }

        let opened = {
            let _guard = self.lock(cell)?;
            let mut inbox = self.load(cell, View::Inbox)?;
            let mut opened = Vec::new();
            for m in &mut inbox.messages {
                if m.status == MessageStatus::Unread && m.dispatch_requested {
                    m.status = MessageStatus::Opened;
                    opened.push(m.id);
                }
            }
            self.save(cell, View::Inbox, &inbox)?;
            opened
        };
        for id in &opened {
            self.bus.publish(&Event::MessageOpened {
                cell: cell.to_string(),
                id: *id,
            });
        }
        Ok(opened)
    }

    /// Opened, dispatch-requested messages in arrival order.
    pub fn dispatchable(&self, cell: &str) -> Result<Vec<Message>, MailboxError> {
        Ok(self
            .list(cell, View::Inbox)?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Opened && m.dispatch_requested)
            .collect())
    }

    /// Messages currently `dispatching` in a cell.
    pub fn in_dispatch(&self, cell: &str) -> Result<Vec<Message>, MailboxError> {
        Ok(self
            .list(cell, View::Inbox)?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Dispatching)
            .collect())
    }

    /// Whether `cell` has sent anything since `since`.
    pub fn sent_since(&self, cell: &str, since: DateTime<Utc>) -> Result<bool, MailboxError> {
        Ok(self
            .list(cell, View::Sent)?
            .iter()
            .any(|m| m.created_at >= since))
    }

    pub fn counts(&self, cell: &str) -> Result<MailboxCounts, MailboxError> {
        let mut counts = MailboxCounts::default();
        for m in self.list(cell, View::Inbox)? {
            match m.status {
                MessageStatus::Unread => counts.unread += 1,
                MessageStatus::Opened => counts.opened += 1,
                MessageStatus::Dispatching => counts.dispatching += 1,
                MessageStatus::Closed => counts.closed += 1,
                MessageStatus::Archived => counts.archived += 1,
            }
        }
        counts.archived += self.load(cell, View::Archive)?.messages.len();
        Ok(counts)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
