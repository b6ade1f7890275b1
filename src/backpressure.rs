//! Backpressure handling for event delivery.
//!
//! The read loop produces events faster than a slow consumer may drain them.
//! Events travel through a bounded channel and the [`DeliveryPolicy`] decides
//! what happens when it is full:
//!
//! - `Block`: the read loop waits for the consumer. The driver queues
//!   further infos on its side meanwhile.
//! - `DropNewest`: the event is discarded, counted and logged.
//!
//! # Configuration
//!
//! - `channel_capacity`: bound of the event channel (default: 1024)
//! - `delivery`: policy applied when the channel is full (default: `Block`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Default event channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// What to do with an event when the consumer is behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Wait until the consumer makes room.
    #[default]
    Block,
    /// Discard the event and count it.
    DropNewest,
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Channel full under `DropNewest`.
    Dropped,
    /// Consumer is gone.
    Closed,
}

/// Shared count of events discarded under `DropNewest`.
///
/// Cloning shares the counter.
#[derive(Debug, Clone, Default)]
pub struct DroppedCounter(Arc<AtomicU64>);

impl DroppedCounter {
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Producer half of the event channel with a policy attached.
///
/// [`deliver`](Self::deliver) blocks the calling thread under `Block`, so it
/// must run on a blocking thread, never inside an async task.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
    policy: DeliveryPolicy,
    dropped: DroppedCounter,
}

impl<T> EventSender<T> {
    pub fn new(tx: mpsc::Sender<T>, policy: DeliveryPolicy) -> Self {
        Self {
            tx,
            policy,
            dropped: DroppedCounter::default(),
        }
    }

    /// Deliver one event according to the policy.
    pub fn deliver(&self, event: T) -> Delivery {
        match self.policy {
            DeliveryPolicy::Block => match self.tx.blocking_send(event) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
            DeliveryPolicy::DropNewest => match self.tx.try_send(event) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => {
                    let total = self.dropped.increment();
                    warn!(total, "event channel full, dropping event");
                    Delivery::Dropped
                }
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }

    /// Handle on the drop counter.
    pub fn dropped(&self) -> DroppedCounter {
        self.dropped.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_policy_default_and_serde() {
        assert_eq!(DeliveryPolicy::default(), DeliveryPolicy::Block);
        let policy: DeliveryPolicy = serde_json::from_str("\"drop_newest\"").unwrap();
        assert_eq!(policy, DeliveryPolicy::DropNewest);
        assert_eq!(serde_json::to_string(&DeliveryPolicy::Block).unwrap(), "\"block\"");
    }

    #[test]
    fn test_drop_newest_counts() {
        let (tx, mut rx) = mpsc::channel(2);
        let sender = EventSender::new(tx, DeliveryPolicy::DropNewest);
        let dropped = sender.dropped();

        assert_eq!(sender.deliver(1), Delivery::Delivered);
        assert_eq!(sender.deliver(2), Delivery::Delivered);
        assert_eq!(sender.deliver(3), Delivery::Dropped);
        assert_eq!(sender.deliver(4), Delivery::Dropped);
        assert_eq!(dropped.get(), 2);

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());

        assert_eq!(sender.deliver(5), Delivery::Delivered);
        assert_eq!(rx.try_recv().unwrap(), 5);
    }

    #[test]
    fn test_block_waits_for_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx, DeliveryPolicy::Block);

        let producer = thread::spawn(move || {
            for i in 0..10 {
                assert_eq!(sender.deliver(i), Delivery::Delivered);
            }
            sender.dropped().get()
        });

        let mut received = Vec::new();
        while received.len() < 10 {
            match rx.try_recv() {
                Ok(v) => received.push(v),
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }

        assert_eq!(producer.join().unwrap(), 0);
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_closed_consumer() {
        let (tx, rx) = mpsc::channel::<u8>(4);
        drop(rx);

        let blocking = EventSender::new(tx.clone(), DeliveryPolicy::Block);
        assert_eq!(blocking.deliver(1), Delivery::Closed);

        let dropping = EventSender::new(tx, DeliveryPolicy::DropNewest);
        assert_eq!(dropping.deliver(1), Delivery::Closed);
        assert_eq!(dropping.dropped().get(), 0);
    }
}
