//! Event bus distributing monitor events to subscribers.
//!
//! A thin wrapper over a tokio broadcast channel: components publish tagged
//! events, any number of consumers subscribe. Slow subscribers may drop old
//! events rather than block publishers.

use tokio::sync::broadcast;

use crate::event::{EventMetadata, MonitorEvent};

/// Default buffer depth for slow subscribers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Broadcast bus for [`MonitorEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(MonitorEvent, EventMetadata)>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `true` if at least one subscriber received it.
    pub fn publish(&self, event: MonitorEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of an [`EventBus`] subscription.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(MonitorEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event, or `None` once the bus is closed.
    ///
    /// If the subscriber lagged, skipped events are dropped and reception
    /// continues with the oldest buffered one.
    pub async fn recv(&mut self) -> Option<(MonitorEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(pair) => return Some(pair),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("event subscriber lagged, dropped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without blocking, if an event is buffered.
    pub fn try_recv(&mut self) -> Option<(MonitorEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}
