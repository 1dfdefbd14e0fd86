//! Status fan-out to connected observers.
//!
//! Each observer owns a bounded queue. A broadcast snapshots the current
//! membership and offers the event to every queue without waiting: a full
//! queue drops the event for that observer only, a closed queue is removed
//! from the set.

mod events;

pub use events::{StatusSnapshot, StreamEvent};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Default per-observer queue capacity.
const DEFAULT_OBSERVER_CAPACITY: usize = 64;

/// Connection identity of an observer.
pub type ObserverId = Uuid;

/// Set of connected notification sinks.
#[derive(Clone)]
pub struct StatusBroadcaster {
    observers: Arc<DashMap<ObserverId, mpsc::Sender<StreamEvent>>>,
    capacity: usize,
}

impl StatusBroadcaster {
    /// Create a new broadcaster with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OBSERVER_CAPACITY)
    }

    /// Create a new broadcaster with specified per-observer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observers: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Add an observer whose first event is `initial`.
    pub fn register(&self, initial: StreamEvent) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();

        // Fresh channel, cannot be full.
        let _ = tx.try_send(initial);
        self.observers.insert(id, tx);
        debug!(observer = %id, total = self.observers.len(), "Observer connected");

        Subscription {
            id,
            receiver: rx,
            broadcaster: self.clone(),
        }
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unregister(&self, id: ObserverId) {
        if self.observers.remove(&id).is_some() {
            debug!(observer = %id, total = self.observers.len(), "Observer disconnected");
        }
    }

    /// Offer `event` to every observer connected at the time of the call.
    ///
    /// Returns the number of observers the event was queued for.
    pub fn notify(&self, event: &StreamEvent) -> usize {
        let sinks: Vec<(ObserverId, mpsc::Sender<StreamEvent>)> = self
            .observers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        debug!(
            event = event.kind(),
            observers = sinks.len(),
            "Broadcasting stream event"
        );

        let mut delivered = 0;
        for (id, sink) in sinks {
            match sink.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(observer = %id, event = event.kind(), "Observer queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => self.unregister(id),
            }
        }
        delivered
    }

    /// Get the number of connected observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of one observer. Dropping it disconnects the observer.
pub struct Subscription {
    id: ObserverId,
    receiver: mpsc::Receiver<StreamEvent>,
    broadcaster: StatusBroadcaster,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event, or `None` once the observer has been removed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.id);
    }
}
