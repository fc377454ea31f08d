//! Message-bus payloads
//!
//! Payloads are encoded as JSON or MessagePack, chosen once per bridge. Maps
//! are ordered so that the same content always encodes to the same bytes.
//! MessagePack structs are written as maps keyed by field name, so clients
//! in other languages decode them like the JSON documents.

use crate::types::{BusError, SignalValue, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Changed values decoded from one received frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalUpdate {
    /// Message name from the catalog
    pub message: String,
    /// CAN message ID
    pub id: u32,
    /// Time the frame was processed
    pub timestamp: Timestamp,
    /// Signal name to physical value, changed signals only
    pub signals: BTreeMap<String, f64>,
}

/// Request to write signal values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Topic for the `WriteReply`; no reply is sent when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Signal name to physical value
    pub signals: BTreeMap<String, f64>,
}

/// Outcome of a `WriteRequest`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteReply {
    /// Signals stored, with the value actually stored
    pub accepted: BTreeMap<String, f64>,
    /// Signals refused, with the reason
    pub rejected: BTreeMap<String, String>,
    /// Event-only messages transmitted because of this request
    pub transmitted: Vec<String>,
    /// Event-only messages whose transmission failed, with the reason
    pub failed: BTreeMap<String, String>,
}

impl WriteReply {
    /// True if every signal was stored and every transmission succeeded
    pub fn is_success(&self) -> bool {
        self.rejected.is_empty() && self.failed.is_empty()
    }
}

/// Request to read stored signal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Topic for the `QueryReply`
    pub reply_to: String,
    /// Signals to read; every stored value when empty
    #[serde(default)]
    pub signals: Vec<String>,
}

/// Answer to a `QueryRequest`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryReply {
    /// Stored values, in request order (catalog order for a full read)
    pub values: Vec<SignalValue>,
    /// Requested names that are unknown or were never set
    pub missing: Vec<String>,
}

/// Payload encoding used on the message bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// UTF-8 JSON text
    #[default]
    Json,
    /// MessagePack binary
    #[serde(alias = "messagepack")]
    Msgpack,
}

impl PayloadFormat {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, BusError> {
        match self {
            PayloadFormat::Json => Ok(serde_json::to_vec(value)?),
            PayloadFormat::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T, BusError> {
        match self {
            PayloadFormat::Json => Ok(serde_json::from_slice(payload)?),
            PayloadFormat::Msgpack => Ok(rmp_serde::from_slice(payload)?),
        }
    }
}

/// Encode a payload as JSON
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, BusError> {
    PayloadFormat::Json.encode(value)
}

/// Decode a JSON payload
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BusError> {
    PayloadFormat::Json.decode(payload)
}
