//! Message catalog
//!
//! Immutable table of message and signal definitions, validated once at
//! construction and shared by the codec, store and scheduler.

use crate::types::CatalogError;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Largest payload accepted for a message (CAN-FD)
pub const MAX_MESSAGE_SIZE: usize = 64;

/// Byte order for signal packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDef {
    /// Signal name, unique across the whole catalog
    pub name: String,
    /// Start bit in the CAN frame (LSB for Intel, MSB for Motorola)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub scale: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
}

impl SignalDef {
    /// Unsigned little-endian signal with identity scaling and no range
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            scale: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
        }
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Declared physical range, or `None` when the signal is unconstrained
    ///
    /// DBC files write `[0|0]` for signals without a range, so any range with
    /// `min >= max` is treated as absent.
    pub fn range(&self) -> Option<(f64, f64)> {
        if self.min < self.max {
            Some((self.min, self.max))
        } else {
            None
        }
    }

    /// Smallest and largest raw value representable in the bit width
    pub fn raw_bounds(&self) -> (i128, i128) {
        let length = u32::from(self.length);
        match self.value_type {
            ValueType::Unsigned => (0, (1i128 << length) - 1),
            ValueType::Signed => (-(1i128 << (length - 1)), (1i128 << (length - 1)) - 1),
        }
    }

    /// Physical bit indices occupied by the signal inside a `size` byte payload
    ///
    /// Indices are `byte * 8 + bit` with bit 0 being the LSB of the byte, and
    /// are ordered from the least significant bit of the value upward.
    /// Returns `None` if the layout does not fit in the payload.
    pub fn bit_positions(&self, size: usize) -> Option<Vec<usize>> {
        let total = size * 8;
        let start = self.start_bit as usize;
        let length = self.length as usize;

        match self.byte_order {
            ByteOrder::LittleEndian => {
                if start + length > total {
                    return None;
                }
                Some((start..start + length).collect())
            }
            ByteOrder::BigEndian => {
                // Start bit is the MSB; walk towards the LSB in DBC sawtooth order
                let mut positions = Vec::with_capacity(length);
                let mut pos = start;
                for i in 0..length {
                    if pos >= total {
                        return None;
                    }
                    positions.push(pos);
                    if i + 1 < length {
                        if pos % 8 == 0 {
                            pos += 15;
                        } else {
                            pos -= 1;
                        }
                    }
                }
                positions.reverse();
                Some(positions)
            }
        }
    }

    /// Smallest physical difference the receive path reports as a change
    pub fn change_threshold(&self) -> f64 {
        self.scale.abs() / 2.0
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidSignal {
            signal: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("empty name"));
        }
        if self.length == 0 || self.length > 64 {
            return Err(invalid("bit length must be between 1 and 64"));
        }
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(invalid("scale must be finite and nonzero"));
        }
        if !self.offset.is_finite() {
            return Err(invalid("offset must be finite"));
        }
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(invalid("range bounds must be finite"));
        }
        Ok(())
    }
}

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDef {
    /// CAN message ID
    pub id: u32,
    /// True if the ID is a 29-bit extended identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Transmission interval; `None` for event-only messages
    pub cycle_time: Option<Duration>,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDef>,
}

impl MessageDef {
    /// Event-only standard-ID message with no signals
    pub fn new(id: u32, name: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            is_extended: false,
            name: name.into(),
            size,
            cycle_time: None,
            sender: None,
            signals: Vec::new(),
        }
    }

    pub fn with_cycle_time(mut self, cycle_time: Duration) -> Self {
        self.cycle_time = Some(cycle_time);
        self
    }

    pub fn with_extended_id(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }

    pub fn with_signal(mut self, signal: SignalDef) -> Self {
        self.signals.push(signal);
        self
    }

    /// True if the scheduler retransmits this message on its own
    pub fn is_periodic(&self) -> bool {
        self.cycle_time.is_some()
    }

    /// Find a signal of this message by name
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.size == 0 || self.size > MAX_MESSAGE_SIZE {
            return Err(CatalogError::InvalidMessage {
                id: self.id,
                reason: format!("size {} outside 1..={}", self.size, MAX_MESSAGE_SIZE),
            });
        }
        if self.cycle_time == Some(Duration::ZERO) {
            return Err(CatalogError::InvalidMessage {
                id: self.id,
                reason: "cycle time must be positive".to_string(),
            });
        }

        // Owner of every payload bit, for overlap detection
        let mut owners: Vec<Option<usize>> = vec![None; self.size * 8];

        for (idx, signal) in self.signals.iter().enumerate() {
            signal.validate()?;

            let positions =
                signal
                    .bit_positions(self.size)
                    .ok_or_else(|| CatalogError::SignalOutOfBounds {
                        signal: signal.name.clone(),
                        message: self.id,
                        size: self.size,
                    })?;

            for pos in positions {
                if let Some(other) = owners[pos] {
                    return Err(CatalogError::OverlappingSignals {
                        message: self.id,
                        first: self.signals[other].name.clone(),
                        second: signal.name.clone(),
                    });
                }
                owners[pos] = Some(idx);
            }
        }

        Ok(())
    }
}

/// The message catalog
#[derive(Debug)]
pub struct Catalog {
    messages: Vec<MessageDef>,

    /// Key: CAN ID, Value: index into `messages`
    by_id: HashMap<u32, usize>,

    /// Key: signal name, Value: (message index, signal index)
    by_signal: HashMap<String, (usize, usize)>,

    /// Messages of the source file that could not be represented
    skipped: Vec<String>,
}

impl Catalog {
    /// Validate the definitions and build the lookup indices
    pub fn new(messages: Vec<MessageDef>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(messages.len());
        let mut by_signal: HashMap<String, (usize, usize)> = HashMap::new();

        for (msg_idx, message) in messages.iter().enumerate() {
            message.validate()?;

            if by_id.insert(message.id, msg_idx).is_some() {
                return Err(CatalogError::DuplicateMessage(message.id));
            }

            for (sig_idx, signal) in message.signals.iter().enumerate() {
                if let Some(&(other_msg, _)) = by_signal.get(&signal.name) {
                    return Err(CatalogError::DuplicateSignal {
                        name: signal.name.clone(),
                        first: messages[other_msg].id,
                        second: message.id,
                    });
                }
                by_signal.insert(signal.name.clone(), (msg_idx, sig_idx));
            }
        }

        log::debug!(
            "Catalog built: {} messages, {} signals",
            messages.len(),
            by_signal.len()
        );

        Ok(Self {
            messages,
            by_id,
            by_signal,
            skipped: Vec::new(),
        })
    }

    /// Record messages of the source file left out of the catalog
    pub fn with_skipped_messages(mut self, names: Vec<String>) -> Self {
        self.skipped = names;
        self
    }

    /// Names of messages left out of the catalog
    pub fn skipped_messages(&self) -> &[String] {
        &self.skipped
    }

    /// Get a message definition by CAN ID
    pub fn lookup_message(&self, id: u32) -> Option<&MessageDef> {
        self.by_id.get(&id).map(|&idx| &self.messages[idx])
    }

    /// Get a signal definition together with the message that carries it
    pub fn lookup_signal(&self, name: &str) -> Option<(&MessageDef, &SignalDef)> {
        self.by_signal.get(name).map(|&(msg_idx, sig_idx)| {
            let message = &self.messages[msg_idx];
            (message, &message.signals[sig_idx])
        })
    }

    /// Get a message definition by name
    pub fn message_by_name(&self, name: &str) -> Option<&MessageDef> {
        self.messages.iter().find(|m| m.name == name)
    }

    /// All messages that carry a cycle time
    pub fn all_periodic_messages(&self) -> impl Iterator<Item = &MessageDef> {
        self.messages.iter().filter(|m| m.is_periodic())
    }

    /// All messages in load order
    pub fn messages(&self) -> &[MessageDef] {
        &self.messages
    }

    pub(crate) fn message_index(&self, id: u32) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub(crate) fn signal_index(&self, name: &str) -> Option<(usize, usize)> {
        self.by_signal.get(name).copied()
    }

    /// Get catalog statistics
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            num_messages: self.messages.len(),
            num_signals: self.by_signal.len(),
            num_periodic: self.all_periodic_messages().count(),
            num_skipped: self.skipped.len(),
        }
    }
}

/// Catalog statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Messages with a cycle time
    pub num_periodic: usize,
    /// Messages of the source file left out (multiplexed)
    pub num_skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_data() -> MessageDef {
        MessageDef::new(0x123, "EngineData", 8)
            .with_cycle_time(Duration::from_millis(100))
            .with_signal(
                SignalDef::new("EngineSpeed", 0, 16)
                    .with_range(0.0, 8000.0)
                    .with_unit("rpm"),
            )
            .with_signal(
                SignalDef::new("EngineTemp", 16, 8)
                    .with_scaling(1.0, -40.0)
                    .with_range(-40.0, 215.0),
            )
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = Catalog::new(Vec::new()).unwrap();
        let stats = catalog.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
        assert_eq!(stats.num_periodic, 0);
        assert_eq!(stats.num_skipped, 0);
    }

    #[test]
    fn test_lookups() {
        let status = MessageDef::new(0x200, "BatteryStatus", 8).with_signal(
            SignalDef::new("BatteryVoltage", 0, 16).with_scaling(0.01, 0.0),
        );
        let catalog = Catalog::new(vec![engine_data(), status]).unwrap();

        let msg = catalog.lookup_message(0x123).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert!(catalog.lookup_message(0x999).is_none());

        let (msg, sig) = catalog.lookup_signal("BatteryVoltage").unwrap();
        assert_eq!(msg.id, 0x200);
        assert_eq!(sig.scale, 0.01);
        assert!(catalog.lookup_signal("Missing").is_none());

        let periodic: Vec<u32> = catalog.all_periodic_messages().map(|m| m.id).collect();
        assert_eq!(periodic, vec![0x123]);

        assert_eq!(catalog.message_by_name("BatteryStatus").unwrap().id, 0x200);
        assert_eq!(catalog.stats().num_signals, 3);
    }

    #[test]
    fn test_overlapping_signals_rejected() {
        let msg = MessageDef::new(0x10, "Overlap", 8)
            .with_signal(SignalDef::new("A", 0, 12))
            .with_signal(SignalDef::new("B", 11, 4));

        match Catalog::new(vec![msg]) {
            Err(CatalogError::OverlappingSignals { first, second, .. }) => {
                assert_eq!(first, "A");
                assert_eq!(second, "B");
            }
            other => panic!("expected overlap error, got {:?}", other),
        }
    }

    #[test]
    fn test_big_endian_overlap_detected() {
        // Motorola 16-bit signal at start bit 7 covers bytes 0 and 1
        let msg = MessageDef::new(0x10, "Mixed", 8)
            .with_signal(SignalDef::new("Hi", 7, 16).with_byte_order(ByteOrder::BigEndian))
            .with_signal(SignalDef::new("Lo", 8, 1));

        assert!(matches!(
            Catalog::new(vec![msg]),
            Err(CatalogError::OverlappingSignals { .. })
        ));
    }

    #[test]
    fn test_signal_out_of_bounds() {
        let msg = MessageDef::new(0x10, "Short", 2).with_signal(SignalDef::new("Wide", 8, 16));
        assert!(matches!(
            Catalog::new(vec![msg]),
            Err(CatalogError::SignalOutOfBounds { size: 2, .. })
        ));

        // Motorola walk running past the last byte
        let msg = MessageDef::new(0x11, "ShortBe", 2)
            .with_signal(SignalDef::new("WideBe", 15, 16).with_byte_order(ByteOrder::BigEndian));
        assert!(matches!(
            Catalog::new(vec![msg]),
            Err(CatalogError::SignalOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_duplicate_signal_names_rejected() {
        let a = MessageDef::new(0x1, "A", 8).with_signal(SignalDef::new("Shared", 0, 8));
        let b = MessageDef::new(0x2, "B", 8).with_signal(SignalDef::new("Shared", 0, 8));

        match Catalog::new(vec![a, b]) {
            Err(CatalogError::DuplicateSignal { name, first, second }) => {
                assert_eq!(name, "Shared");
                assert_eq!((first, second), (0x1, 0x2));
            }
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_message_and_bad_scale() {
        let a = MessageDef::new(0x1, "A", 8);
        let b = MessageDef::new(0x1, "B", 8);
        assert!(matches!(
            Catalog::new(vec![a, b]),
            Err(CatalogError::DuplicateMessage(0x1))
        ));

        let msg = MessageDef::new(0x3, "C", 8)
            .with_signal(SignalDef::new("Zero", 0, 8).with_scaling(0.0, 0.0));
        assert!(matches!(
            Catalog::new(vec![msg]),
            Err(CatalogError::InvalidSignal { .. })
        ));
    }

    #[test]
    fn test_bit_positions() {
        let le = SignalDef::new("Le", 4, 8);
        assert_eq!(le.bit_positions(2).unwrap(), (4..12).collect::<Vec<_>>());

        let be = SignalDef::new("Be", 7, 12).with_byte_order(ByteOrder::BigEndian);
        // LSB first: byte 1 bits 7..4, then byte 0 bits 0..7
        assert_eq!(
            be.bit_positions(2).unwrap(),
            vec![12, 13, 14, 15, 0, 1, 2, 3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn test_range_and_raw_bounds() {
        let sig = SignalDef::new("S", 0, 8).with_value_type(ValueType::Signed);
        assert_eq!(sig.raw_bounds(), (-128, 127));
        assert_eq!(sig.range(), None);

        let sig = SignalDef::new("U", 0, 64).with_range(-1.0, 1.0);
        assert_eq!(sig.raw_bounds(), (0, u64::MAX as i128));
        assert_eq!(sig.range(), Some((-1.0, 1.0)));
    }
}
