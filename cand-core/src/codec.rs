//! Frame codec
//!
//! Converts between raw CAN frames and physical signal values using the
//! catalog. Handles bit packing for both byte orders, sign extension and
//! scale/offset conversion.

use crate::config::{within_range, RangePolicy};
use crate::signals::{Catalog, MessageDef, SignalDef, ValueType};
use crate::types::{DecodeError, EncodeError, Frame, SignalMap};
use std::sync::Arc;

/// A signal extracted from a frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Signal name from the catalog
    pub name: String,
    /// Physical value (`raw * scale + offset`), never clamped
    pub value: f64,
    /// Raw value before scaling (sign-extended for signed signals)
    pub raw: i64,
    /// False if the value lies outside the declared range
    pub in_range: bool,
}

/// All signals of one decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// CAN message ID
    pub id: u32,
    /// Message name from the catalog
    pub message_name: String,
    /// Decoded signals in catalog order
    pub signals: Vec<DecodedSignal>,
}

impl DecodedFrame {
    /// Signal name to physical value
    pub fn to_map(&self) -> SignalMap {
        self.signals
            .iter()
            .map(|s| (s.name.clone(), s.value))
            .collect()
    }

    /// Signals whose decoded value is outside the declared range
    pub fn out_of_range(&self) -> impl Iterator<Item = &DecodedSignal> {
        self.signals.iter().filter(|s| !s.in_range)
    }
}

/// Encoder/decoder bound to a catalog and a range policy
#[derive(Debug, Clone)]
pub struct FrameCodec {
    catalog: Arc<Catalog>,
    policy: RangePolicy,
}

impl FrameCodec {
    pub fn new(catalog: Arc<Catalog>, policy: RangePolicy) -> Self {
        Self { catalog, policy }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// Encode a message from physical values
    ///
    /// `values` should already contain the last known values of the message
    /// (a store snapshot) merged with any new ones. Signals without a value
    /// encode physical zero, brought into the declared range. Names that do
    /// not belong to the message are ignored.
    pub fn encode(&self, message: &MessageDef, values: &SignalMap) -> Result<Frame, EncodeError> {
        let mut data = vec![0u8; message.size];

        for signal in &message.signals {
            let physical = match values.get(&signal.name) {
                Some(&value) => self.check_value(signal, value)?,
                None => default_value(signal),
            };

            let raw = physical_to_raw(signal, physical);
            insert_raw(&mut data, message.size, signal, raw);
        }

        Ok(Frame {
            id: message.id,
            is_extended: message.is_extended,
            data,
        })
    }

    /// Decode a frame into physical values
    pub fn decode(&self, frame: &Frame) -> Result<DecodedFrame, DecodeError> {
        let message = self
            .catalog
            .lookup_message(frame.id)
            .ok_or(DecodeError::UnknownMessage(frame.id))?;

        if frame.data.len() != message.size {
            return Err(DecodeError::LengthMismatch {
                id: frame.id,
                expected: message.size,
                actual: frame.data.len(),
            });
        }

        let signals = message
            .signals
            .iter()
            .map(|signal| decode_signal(&frame.data, message.size, signal))
            .collect();

        Ok(DecodedFrame {
            id: message.id,
            message_name: message.name.clone(),
            signals,
        })
    }

    fn check_value(&self, signal: &SignalDef, value: f64) -> Result<f64, EncodeError> {
        if !value.is_finite() {
            return Err(EncodeError::NonFinite {
                signal: signal.name.clone(),
            });
        }

        self.policy
            .apply(signal, value)
            .map_err(|(min, max)| EncodeError::OutOfRange {
                signal: signal.name.clone(),
                value,
                min,
                max,
            })
    }
}

fn default_value(signal: &SignalDef) -> f64 {
    signal
        .range()
        .map_or(0.0, |(min, max)| 0.0_f64.clamp(min, max))
}

fn decode_signal(data: &[u8], size: usize, signal: &SignalDef) -> DecodedSignal {
    let bits = extract_raw(data, size, signal);

    let (raw, raw_f64) = match signal.value_type {
        ValueType::Unsigned => (bits as i64, bits as f64),
        ValueType::Signed => {
            let value = sign_extend(bits, signal.length as usize);
            (value, value as f64)
        }
    };

    let value = signal.offset + signal.scale * raw_f64;
    let in_range = signal
        .range()
        .map_or(true, |(min, max)| within_range(value, min, max));

    DecodedSignal {
        name: signal.name.clone(),
        value,
        raw,
        in_range,
    }
}

/// Convert a physical value into the bit pattern stored in the frame
fn physical_to_raw(signal: &SignalDef, physical: f64) -> u64 {
    let (lo, hi) = signal.raw_bounds();
    let raw = (((physical - signal.offset) / signal.scale).round() as i128).clamp(lo, hi);
    (raw as u64) & value_mask(signal.length as usize)
}

fn value_mask(length: usize) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

/// Extract the raw bit pattern of a signal
///
/// Bit `i` of the result comes from the i-th payload position returned by
/// `SignalDef::bit_positions`, which already encodes the byte order.
fn extract_raw(data: &[u8], size: usize, signal: &SignalDef) -> u64 {
    let mut result: u64 = 0;

    for (i, pos) in signal
        .bit_positions(size)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
    {
        let bit_value = (data[pos / 8] >> (pos % 8)) & 0x01;
        result |= (bit_value as u64) << i;
    }

    result
}

/// Write a raw bit pattern into the payload, leaving other bits untouched
fn insert_raw(data: &mut [u8], size: usize, signal: &SignalDef, raw: u64) {
    for (i, pos) in signal
        .bit_positions(size)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
    {
        let mask = 1u8 << (pos % 8);
        if (raw >> i) & 0x01 != 0 {
            data[pos / 8] |= mask;
        } else {
            data[pos / 8] &= !mask;
        }
    }
}

/// Sign-extend a value from N bits to 64 bits
///
/// If the value's MSB is 1, fill the upper bits with 1s.
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}
