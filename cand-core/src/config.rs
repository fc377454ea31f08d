//! Bridge configuration types
//!
//! This module defines the configuration shared by the codec, store and the
//! message-bus facing components. The range policy lives here so that the
//! encode path and store-level writes apply exactly the same rule.

use crate::bus::PayloadFormat;
use crate::signals::SignalDef;
use serde::{Deserialize, Serialize};

/// Relative slack accepted at range bounds to absorb scale/offset rounding
const RANGE_TOLERANCE: f64 = 1e-9;

/// What to do with a physical value outside a signal's declared range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    /// Bring the value to the nearest bound
    Clamp,
    /// Refuse the value
    #[default]
    Reject,
}

impl RangePolicy {
    /// Apply the policy to a finite value
    ///
    /// Returns the value to use, or the violated `(min, max)` range.
    pub fn apply(self, signal: &SignalDef, value: f64) -> Result<f64, (f64, f64)> {
        let Some((min, max)) = signal.range() else {
            return Ok(value);
        };

        if within_range(value, min, max) {
            return Ok(value.clamp(min, max));
        }

        match self {
            RangePolicy::Clamp => Ok(value.clamp(min, max)),
            RangePolicy::Reject => Err((min, max)),
        }
    }
}

/// Range check with a small relative tolerance at the bounds
pub fn within_range(value: f64, min: f64, max: f64) -> bool {
    let tolerance = RANGE_TOLERANCE * min.abs().max(max.abs()).max(1.0);
    value >= min - tolerance && value <= max + tolerance
}

/// Configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Clamp or reject out-of-range physical values (encode and store writes)
    pub range_policy: RangePolicy,

    /// Decoded values are published on `<rx_topic_prefix>.<MessageName>`
    pub rx_topic_prefix: String,

    /// Topic carrying signal write requests
    pub tx_topic: String,

    /// Topic carrying signal read requests
    pub query_topic: String,

    /// Topic for periodic bridge statistics
    pub status_topic: String,

    /// Encoding of every payload the bridge publishes or reads
    pub payload_format: PayloadFormat,

    /// Statistics publishing interval; disabled when absent
    pub status_interval_ms: Option<u64>,

    /// Capacity of the incoming frame queue of transports that buffer
    pub frame_queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            range_policy: RangePolicy::default(),
            rx_topic_prefix: "can.rx".to_string(),
            tx_topic: "can.tx".to_string(),
            query_topic: "can.query".to_string(),
            status_topic: "can.status".to_string(),
            payload_format: PayloadFormat::default(),
            status_interval_ms: None,
            frame_queue_capacity: 1024,
        }
    }
}

impl BridgeConfig {
    /// Create a new bridge configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the range policy
    pub fn with_range_policy(mut self, policy: RangePolicy) -> Self {
        self.range_policy = policy;
        self
    }

    /// Builder method: set the prefix for republished decoded values
    pub fn with_rx_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.rx_topic_prefix = prefix.into();
        self
    }

    /// Builder method: set the write request topic
    pub fn with_tx_topic(mut self, topic: impl Into<String>) -> Self {
        self.tx_topic = topic.into();
        self
    }

    /// Builder method: set the read request topic
    pub fn with_query_topic(mut self, topic: impl Into<String>) -> Self {
        self.query_topic = topic.into();
        self
    }

    /// Builder method: set the payload encoding
    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }

    /// Builder method: publish statistics every `interval_ms`
    pub fn with_status_interval(mut self, interval_ms: u64) -> Self {
        self.status_interval_ms = Some(interval_ms);
        self
    }

    /// Topic on which values decoded from `message_name` are published
    pub fn rx_topic(&self, message_name: &str) -> String {
        format!("{}.{}", self.rx_topic_prefix, message_name)
    }
}
