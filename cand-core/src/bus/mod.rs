//! Message-bus client interface
//!
//! The bridge publishes decoded values and receives write and read requests
//! through a publish/subscribe bus. Topics are dot-separated strings; a
//! subscription pattern is either an exact topic, `*`, or a prefix followed
//! by `.*`.

use crate::types::BusError;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod local;
pub mod payload;
#[cfg(feature = "redis")]
pub mod redis_bus;

pub use local::LocalBus;
pub use payload::{
    from_payload, to_payload, PayloadFormat, QueryReply, QueryRequest, SignalUpdate, WriteReply,
    WriteRequest,
};
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

/// One message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Encoded payload
    pub payload: Vec<u8>,
}

/// Stream of messages matching one topic pattern
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            rx,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message, `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// Publish/subscribe transport used by the bridge
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to a topic pattern
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}

/// Check a topic used for publishing
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.contains('*') || topic.split('.').any(str::is_empty) {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Check a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    if pattern == "*" {
        return Ok(());
    }
    let exact = pattern.strip_suffix(".*").unwrap_or(pattern);
    validate_topic(exact).map_err(|_| BusError::InvalidTopic(pattern.to_string()))
}

/// Does `topic` match the subscription `pattern`?
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1),
        None => pattern == topic,
    }
}
