//! In-process message bus
//!
//! Every subscriber gets its own bounded queue. Publishing never waits on a
//! slow subscriber: when its queue is full the message is dropped for that
//! subscriber only and counted.

use super::{topic_matches, validate_pattern, validate_topic, BusMessage, MessageBus, Subscription};
use crate::types::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber queue length
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Topic router living inside the daemon process
#[derive(Debug)]
pub struct LocalBus {
    subscribers: Mutex<Vec<Subscriber>>,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_capacity: queue_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Messages dropped because a subscriber queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_topic(topic)?;

        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|s| !s.tx.is_closed());
            subscribers
                .iter()
                .filter(|s| topic_matches(&s.pattern, topic))
                .map(|s| s.tx.clone())
                .collect()
        };

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };

        for tx in targets {
            match tx.try_send(message.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "Subscriber queue full, dropped message on {} ({} dropped so far)",
                        topic,
                        dropped
                    );
                }
            }
        }

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        validate_pattern(pattern)?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });

        log::debug!("New subscription on {}", pattern);
        Ok(Subscription::new(pattern, rx))
    }
}
