//! Event bus for document and replication notifications.
//!
//! Events are delivered synchronously on the thread that completed the
//! mutation, after its transaction committed. Subscribers receive events
//! over a channel so a slow listener never blocks the mutating thread;
//! listeners that need to touch the store queue that work instead of
//! re-entering it from the delivery path.

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A notification from the store or a replicator.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A document gained its first revision.
    DocumentCreated {
        /// Document id.
        doc_id: String,
        /// The new winning revision id.
        rev_id: String,
    },
    /// A document gained a new winning revision.
    DocumentUpdated {
        /// Document id.
        doc_id: String,
        /// The new winning revision id.
        rev_id: String,
    },
    /// A document's winner became a tombstone.
    DocumentDeleted {
        /// Document id.
        doc_id: String,
        /// The tombstone revision id.
        rev_id: String,
    },
    /// A replicator began a run.
    ReplicationStarted {
        /// Stable replication id of the run.
        replication_id: String,
    },
    /// A replicator finished a run, either to completion or by request.
    ///
    /// Exactly one of this or [`Event::ReplicationErrored`] is posted per
    /// run; the replicator's final state distinguishes complete from
    /// stopped.
    ReplicationCompleted {
        /// Stable replication id of the run.
        replication_id: String,
        /// Documents moved during the run.
        documents_replicated: u64,
        /// Batches checkpointed during the run.
        batches_replicated: u64,
    },
    /// A replicator aborted on a fatal error.
    ReplicationErrored {
        /// Stable replication id of the run.
        replication_id: String,
        /// Description of the first fatal error.
        message: String,
    },
}

/// Distributes events to any number of subscribers.
pub struct EventBus {
    subscribers: RwLock<Vec<Sender<Event>>>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Posts an event to every live subscriber, dropping disconnected ones.
    pub fn post(&self, event: Event) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(doc_id: &str) -> Event {
        Event::DocumentCreated {
            doc_id: doc_id.into(),
            rev_id: "1-abc".into(),
        }
    }

    #[test]
    fn post_reaches_all_subscribers() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.post(created("d1"));
        assert_eq!(rx1.try_recv().unwrap(), created("d1"));
        assert_eq!(rx2.try_recv().unwrap(), created("d1"));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.post(created("d1"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
