//! In-process event bus.
//!
//! A bounded, non-blocking publish/subscribe channel. Publishers never
//! block: when a subscriber's channel is full the event is dropped for
//! that subscriber and the overflow counter is incremented. Subscribers
//! get a best-effort view across builds; the durable event log provides
//! the ordered view within a build.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::event::BuildEvent;

pub const DEFAULT_BUS_CAPACITY: usize = 4096;

pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<BuildEvent>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber with its own bounded queue.
    pub fn subscribe(&self) -> mpsc::Receiver<BuildEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber without blocking.
    pub fn publish(&self, event: BuildEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceId;
    use crate::event::EventType;

    fn event() -> BuildEvent {
        BuildEvent::new(ResourceId::new(), EventType::StepOutput)
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(event());

        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert_eq!(bus.dropped(), 0);
    }

    #[tokio::test]
    async fn drops_on_full_queue_and_counts() {
        let bus = EventBus::new(2);
        let _rx = bus.subscribe();

        for _ in 0..5 {
            bus.publish(event());
        }

        // Capacity 2, five published: three dropped.
        assert_eq!(bus.dropped(), 3);
    }

    #[tokio::test]
    async fn prunes_closed_subscribers() {
        let bus = EventBus::new(2);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(event());
        assert_eq!(bus.subscriber_count(), 0);
        // Dropped counter does not move for closed subscribers.
        assert_eq!(bus.dropped(), 0);
    }
}
