//! Redis pub/sub message bus
//!
//! Publishing goes through a shared connection manager that reconnects on
//! its own. Every subscription owns a dedicated pub/sub connection and a
//! forwarding task that ends when the `Subscription` is dropped.
//!
//! Exact topics map onto `SUBSCRIBE`; `*` and `prefix.*` patterns map onto
//! `PSUBSCRIBE` with the prefix glob-escaped. Redis globs also match
//! `prefix.` itself, so delivered topics are checked against the pattern
//! once more.

use super::{topic_matches, validate_pattern, validate_topic, BusMessage, MessageBus, Subscription};
use crate::types::BusError;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber queue length
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Message bus backed by a Redis server
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    queue_capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl RedisBus {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let publisher = client.get_connection_manager().await?;

        log::info!("Connected to Redis at {}", url);

        Ok(Self {
            client,
            publisher,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    /// Messages dropped because a subscriber queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Redis glob for a subscription pattern, `None` for an exact topic
fn redis_glob(pattern: &str) -> Option<String> {
    if pattern == "*" {
        return Some("*".to_string());
    }

    let prefix = pattern.strip_suffix(".*")?;
    let mut glob = String::with_capacity(pattern.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            glob.push('\\');
        }
        glob.push(c);
    }
    glob.push_str(".*");
    Some(glob)
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        validate_topic(topic)?;

        let mut connection = self.publisher.clone();
        let receivers: i64 = connection.publish(topic, payload).await?;
        log::trace!("Published on {} to {} receivers", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        validate_pattern(pattern)?;

        let mut pubsub = self.client.get_async_pubsub().await?;
        match redis_glob(pattern) {
            Some(glob) => pubsub.psubscribe(&glob).await?,
            None => pubsub.subscribe(pattern).await?,
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::clone(&self.dropped);
        let task_pattern = pattern.to_string();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());

            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    message = messages.next() => message,
                };
                let Some(message) = message else {
                    log::error!("Redis connection for {} lost", task_pattern);
                    break;
                };

                let topic = message.get_channel_name().to_string();
                if !topic_matches(&task_pattern, &topic) {
                    continue;
                }

                let message = BusMessage {
                    topic,
                    payload: message.get_payload_bytes().to_vec(),
                };
                match tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Closed(_)) => break,
                    Err(TrySendError::Full(message)) => {
                        let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        log::warn!(
                            "Subscriber queue full, dropped message on {} ({} dropped so far)",
                            message.topic,
                            total
                        );
                    }
                }
            }

            log::debug!("Redis subscription on {} ended", task_pattern);
        });

        log::debug!("New Redis subscription on {}", pattern);
        Ok(Subscription::new(pattern, rx))
    }
}
