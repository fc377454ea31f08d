//! Core types for the CAN bridge
//!
//! Frames, stored signal values and the error taxonomy shared by the catalog,
//! codec, store, scheduler and the two pumps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Timestamp type used for stored signal values
pub type Timestamp = DateTime<Utc>;

/// Mapping of signal name to physical value
pub type SignalMap = HashMap<String, f64>;

/// A single CAN frame as handed to or received from the bus transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// True if this is an extended (29-bit) CAN ID
    #[serde(default)]
    pub is_extended: bool,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a standard-ID frame
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            is_extended: false,
            data,
        }
    }

    /// Create an extended-ID frame
    pub fn extended(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            is_extended: true,
            data,
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X} [{}]", self.id, self.data.len())?;
        } else {
            write!(f, "{:03X} [{}]", self.id, self.data.len())?;
        }
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Where a stored value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// Decoded from a frame received on the CAN bus
    Bus,
    /// Written by a message-bus client
    Command,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::Bus => write!(f, "bus"),
            ValueSource::Command => write!(f, "command"),
        }
    }
}

/// Latest known value of one signal, as handed out by the signal store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalValue {
    /// Signal name from the catalog
    pub name: String,
    /// Physical value (after scale and offset)
    pub value: f64,
    /// Wall-clock time of the last update
    pub timestamp: Timestamp,
    /// Origin of the last update
    pub source: ValueSource,
}

/// Errors raised while building the message catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Duplicate signal name '{name}' in messages 0x{first:X} and 0x{second:X}")]
    DuplicateSignal { name: String, first: u32, second: u32 },

    #[error("Duplicate message ID 0x{0:X}")]
    DuplicateMessage(u32),

    #[error("Invalid message 0x{id:X}: {reason}")]
    InvalidMessage { id: u32, reason: String },

    #[error("Invalid signal '{signal}': {reason}")]
    InvalidSignal { signal: String, reason: String },

    #[error("Signal '{signal}' does not fit in the {size} byte payload of message 0x{message:X}")]
    SignalOutOfBounds {
        signal: String,
        message: u32,
        size: usize,
    },

    #[error("Signals '{first}' and '{second}' overlap in message 0x{message:X}")]
    OverlappingSignals {
        message: u32,
        first: String,
        second: String,
    },

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised while encoding a frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("Value {value} for signal '{signal}' is outside [{min}, {max}]")]
    OutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Value for signal '{signal}' is not a finite number")]
    NonFinite { signal: String },
}

/// Errors raised while decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Message not found: CAN ID 0x{0:X}")]
    UnknownMessage(u32),

    #[error("Length mismatch for CAN ID 0x{id:X}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        id: u32,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised when a write is refused by the signal store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Signal not found: {0}")]
    UnknownSignal(String),

    #[error("Value {value} for signal '{signal}' is outside [{min}, {max}]")]
    OutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Value for signal '{0}' is not a finite number")]
    NonFinite(String),
}

impl ValidationError {
    /// Name of the refused signal
    pub fn signal(&self) -> &str {
        match self {
            ValidationError::UnknownSignal(name) | ValidationError::NonFinite(name) => name,
            ValidationError::OutOfRange { signal, .. } => signal,
        }
    }
}

/// Errors reported by a bus transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Frame rejected by transport: {0}")]
    InvalidFrame(String),

    #[error("Receive queue overrun, {0} frames lost")]
    Overrun(u64),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors reported by a message-bus client
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Message bus closed")]
    Closed,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Message bus backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Payload(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BusError::Payload(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BusError::Payload(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Backend(e.to_string())
    }
}

/// Errors raised when the scheduler fails to put a message on the bus
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    #[error("Message not found: CAN ID 0x{0:X}")]
    UnknownMessage(u32),

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Send failed: {0}")]
    Transport(#[from] TransportError),
}
