//! The single current reading and its subscribers.
//!
//! Whichever source is active publishes whole readings; the slot is swapped and
//! the broadcast sent under the same write guard, so a new subscriber sees each
//! reading exactly once: either as its attach-time snapshot or as an update.

use simulator::SensorReading;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

pub struct TelemetryHub {
    current: RwLock<Arc<SensorReading>>,
    updates: broadcast::Sender<Arc<SensorReading>>,
}

impl TelemetryHub {
    pub fn new(initial: SensorReading, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            current: RwLock::new(Arc::new(initial)),
            updates,
        }
    }

    /// Snapshot of the current reading
    pub fn latest(&self) -> Arc<SensorReading> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current reading and push it to every subscriber
    pub fn publish(&self, reading: SensorReading) {
        let reading = Arc::new(reading);
        let mut slot = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = reading.clone();
        // No subscribers is not an error
        let _ = self.updates.send(reading);
    }

    pub fn subscribe(&self) -> Subscription {
        let slot = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Subscription {
            pending: Some(slot.clone()),
            updates: self.updates.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }
}

/// Yields the attach-time reading first, then every later one
pub struct Subscription {
    pending: Option<Arc<SensorReading>>,
    updates: broadcast::Receiver<Arc<SensorReading>>,
}

impl Subscription {
    /// `None` once the hub is gone. A subscriber that falls behind skips to the
    /// oldest reading still buffered.
    pub async fn recv(&mut self) -> Option<Arc<SensorReading>> {
        if let Some(reading) = self.pending.take() {
            return Some(reading);
        }

        loop {
            match self.updates.recv().await {
                Ok(reading) => return Some(reading),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Subscriber lagged, skipped {} readings", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
