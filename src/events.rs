//! Core event stream shared by all components.
//!
//! Subscriptions are explicit: [`EventBus::subscribe`] hands back a receiver
//! whose registration is removed when the handle is dropped. Each event is
//! delivered once per subscriber, in the order it was published. Subscribers
//! receive owned copies of records, never references into component buffers.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{Receiver, RecvTimeoutError, Sender, channel},
    },
    time::Duration,
};

use crate::{
    metrics::MetricsSnapshot,
    store::{ErrorRecord, LogRecord, ProcessRecord, ProcessStatus},
};

/// Events published by the supervisor core.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A log record was persisted.
    NewLog(LogRecord),
    /// A process reached the running state.
    ProcessStarted(ProcessRecord),
    /// A process was stopped on request.
    ProcessStopped {
        /// The stopped process id.
        id: String,
    },
    /// A child exited and was classified.
    ProcessExited {
        /// The exited process id.
        id: String,
        /// Exit code when the child terminated normally.
        code: Option<i32>,
        /// Signal name when the child was signalled.
        signal: Option<String>,
        /// Post-exit lifecycle state.
        status: ProcessStatus,
    },
    /// An error record was persisted.
    NewError(ErrorRecord),
    /// An error of a critical kind was persisted.
    CriticalError(ErrorRecord),
    /// An error was marked resolved for the first time.
    ErrorResolved {
        /// The resolved error id.
        id: i64,
        /// The note recorded at resolution time.
        note: Option<String>,
    },
    /// A metrics cycle completed.
    MetricsCollected(MetricsSnapshot),
    /// A group was created.
    GroupCreated {
        /// The new group id.
        id: String,
    },
    /// A process joined a group.
    ProcessAddedToGroup {
        /// The member process.
        process_id: String,
        /// The receiving group.
        group_id: String,
    },
    /// A process left its group.
    ProcessRemovedFromGroup {
        /// The departing process.
        process_id: String,
    },
    /// A group start pass finished.
    GroupStarted {
        /// The group id.
        id: String,
        /// Ids that were started (or already running).
        started: Vec<String>,
    },
    /// A group stop pass finished.
    GroupStopped {
        /// The group id.
        id: String,
    },
    /// A group start pass hit per-member failures.
    GroupStartErrors {
        /// The group id.
        id: String,
        /// One message per failed member.
        errors: Vec<String>,
    },
    /// A group was deleted.
    GroupDeleted {
        /// The removed group id.
        id: String,
    },
}

struct Registry {
    next_id: u64,
    subscribers: HashMap<u64, Sender<CoreEvent>>,
}

/// Fan-out registry for [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Registers a new subscriber and returns its receiving handle.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = channel();
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        EventSubscription {
            id,
            receiver: rx,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Delivers `event` to every live subscriber; dropped subscribers are
    /// pruned.
    pub fn publish(&self, event: CoreEvent) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

/// A registered subscriber; dropping it unsubscribes.
pub struct EventSubscription {
    id: u64,
    receiver: Receiver<CoreEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl EventSubscription {
    /// Blocks until the next event or the timeout elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<CoreEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Returns a pending event without blocking.
    pub fn try_recv(&self) -> Option<CoreEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drains everything currently queued.
    pub fn drain(&self) -> Vec<CoreEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            out.push(event);
        }
        out
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry.subscribers.remove(&self.id);
    }
}
