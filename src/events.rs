//! Typed publish/subscribe bus for lifecycle events.
//!
//! Publishers don't know who listens. Subscribers get a borrowed [`Event`]
//! synchronously on the publishing thread, so they must be quick; anything
//! slow should forward to a channel (see [`EventBus::subscribe_channel`]).

use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::mailbox::MessageStatus;

pub const MESSAGE_DELIVERED: &str = "message.delivered";
pub const MESSAGE_OPENED: &str = "message.opened";
pub const MESSAGE_ARCHIVED: &str = "message.archived";
pub const DISPATCH_STARTED: &str = "dispatch.started";
pub const DISPATCH_SKIPPED: &str = "dispatch.skipped";
pub const DISPATCH_FINISHED: &str = "dispatch.finished";
pub const ERROR_DETECTED: &str = "error.detected";
pub const BREAKER_CHANGED: &str = "breaker.changed";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    MessageDelivered {
        cell: String,
        id: u64,
        from: String,
        dispatch_requested: bool,
    },
    MessageOpened {
        cell: String,
        id: u64,
    },
    MessageArchived {
        cell: String,
        id: u64,
    },
    DispatchStarted {
        cell: String,
        message_id: Option<u64>,
        pid: u32,
    },
    DispatchSkipped {
        cell: String,
        message_id: Option<u64>,
        reason: String,
    },
    DispatchFinished {
        cell: String,
        message_id: Option<u64>,
        outcome: String,
        status: Option<MessageStatus>,
    },
    ErrorDetected {
        fingerprint: String,
        component: String,
        count: u64,
        is_new: bool,
    },
    BreakerChanged {
        from: String,
        to: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MessageDelivered { .. } => MESSAGE_DELIVERED,
            Event::MessageOpened { .. } => MESSAGE_OPENED,
            Event::MessageArchived { .. } => MESSAGE_ARCHIVED,
            Event::DispatchStarted { .. } => DISPATCH_STARTED,
            Event::DispatchSkipped { .. } => DISPATCH_SKIPPED,
            Event::DispatchFinished { .. } => DISPATCH_FINISHED,
            Event::ErrorDetected { .. } => ERROR_DETECTED,
            Event::BreakerChanged { .. } => BREAKER_CHANGED,
        }
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.subscribers.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("subscribers", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, f: impl Fn(&Event) + Send + Sync + 'static) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push(Box::new(f));
        }
    }

    /// Subscribe with a filter, forwarding matching events to a channel.
    pub fn subscribe_channel(
        &self,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Receiver<Event> {
        let (tx, rx): (Sender<Event>, Receiver<Event>) = channel();
        let tx = std::sync::Mutex::new(tx);
        self.subscribe(move |event| {
            if filter(event)
                && let Ok(tx) = tx.lock()
            {
                let _ = tx.send(event.clone());
            }
        });
        rx
    }

    /// Fire and forget. A panicking subscriber poisons nothing for the
    /// publisher beyond this call.
    pub fn publish(&self, event: &Event) {
        tracing::trace!(event = event.name(), "publish");
        if let Ok(subs) = self.subscribers.read() {
            for sub in subs.iter() {
                sub(event);
            }
        }
    }
}
