//! DBC file loader
//!
//! Parses Vector DBC files and converts them into catalog definitions.
//! Cycle times come from the `GenMsgCycleTime` message attribute, falling
//! back to the attribute's `BA_DEF_DEF_` default.

use crate::signals::catalog::{ByteOrder, Catalog, MessageDef, SignalDef, ValueType};
use crate::types::CatalogError;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Message attribute holding the transmission interval in milliseconds
pub const CYCLE_TIME_ATTRIBUTE: &str = "GenMsgCycleTime";

/// Bit 31 of a DBC message ID marks a 29-bit extended identifier
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Messages read from a DBC file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbcDefinitions {
    /// Messages the bridge can encode and decode
    pub messages: Vec<MessageDef>,
    /// Names of multiplexed messages left out of `messages`
    pub skipped: Vec<String>,
}

impl DbcDefinitions {
    /// Build a catalog, keeping track of the skipped messages
    pub fn into_catalog(self) -> Result<Catalog, CatalogError> {
        Ok(Catalog::new(self.messages)?.with_skipped_messages(self.skipped))
    }
}

/// Load a DBC file and build a catalog from it
pub fn load_dbc_file(path: &Path) -> Result<Catalog, CatalogError> {
    parse_dbc_file(path)?.into_catalog()
}

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<DbcDefinitions, CatalogError> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        CatalogError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1/Windows-1252
    let dbc_content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let definitions = parse_dbc_str(&dbc_content)?;

    log::info!(
        "Parsed {} messages from {:?} ({} skipped)",
        definitions.messages.len(),
        path,
        definitions.skipped.len()
    );

    Ok(definitions)
}

/// Parse DBC text and return message definitions
pub fn parse_dbc_str(content: &str) -> Result<DbcDefinitions, CatalogError> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| CatalogError::DbcParseError(format!("{:?}", e)))?;

    let cycle_times = collect_cycle_times(&dbc);
    let default_cycle_time = default_cycle_time(&dbc);

    let mut definitions = DbcDefinitions::default();

    for dbc_msg in dbc.messages() {
        if is_multiplexed(dbc_msg) {
            log::warn!(
                "Skipping multiplexed message {} (0x{:X}): multiplexing is not supported",
                dbc_msg.message_name(),
                dbc_msg.message_id().0
            );
            definitions.skipped.push(dbc_msg.message_name().to_string());
            continue;
        }

        // An explicit 0 overrides a non-zero default
        let cycle_ms = cycle_times
            .get(&dbc_msg.message_id().0)
            .copied()
            .or(default_cycle_time);
        let cycle_time = cycle_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        definitions
            .messages
            .push(convert_message(dbc_msg, cycle_time)?);
    }

    Ok(definitions)
}

/// Collect per-message `GenMsgCycleTime` values in milliseconds, keyed by raw
/// DBC message ID
fn collect_cycle_times(dbc: &can_dbc::DBC) -> HashMap<u32, u64> {
    let mut cycle_times = HashMap::new();

    for attribute in dbc.attribute_values() {
        if attribute.attribute_name() != CYCLE_TIME_ATTRIBUTE {
            continue;
        }

        if let can_dbc::AttributeValuedForObjectType::MessageDefinitionAttributeValue(
            message_id,
            Some(value),
        ) = attribute.attribute_value()
        {
            match attribute_millis(value) {
                Some(ms) => {
                    cycle_times.insert(message_id.0, ms);
                }
                None => log::warn!(
                    "Ignoring non-numeric {} for message 0x{:X}",
                    CYCLE_TIME_ATTRIBUTE,
                    message_id.0
                ),
            }
        }
    }

    cycle_times
}

/// `BA_DEF_DEF_` value of `GenMsgCycleTime`, if declared
fn default_cycle_time(dbc: &can_dbc::DBC) -> Option<u64> {
    let default = dbc
        .attribute_defaults()
        .iter()
        .find(|d| d.attribute_name() == CYCLE_TIME_ATTRIBUTE)?;

    let ms = attribute_millis(default.attribute_value());
    if ms.is_none() {
        log::warn!("Ignoring non-numeric default for {}", CYCLE_TIME_ATTRIBUTE);
    }
    ms
}

fn attribute_millis(value: &can_dbc::AttributeValue) -> Option<u64> {
    match value {
        can_dbc::AttributeValue::AttributeValueU64(v) => Some(*v),
        can_dbc::AttributeValue::AttributeValueI64(v) => u64::try_from(*v).ok(),
        can_dbc::AttributeValue::AttributeValueF64(v) if *v >= 0.0 => Some(v.round() as u64),
        _ => None,
    }
}

fn is_multiplexed(dbc_msg: &can_dbc::Message) -> bool {
    dbc_msg
        .signals()
        .iter()
        .any(|s| !matches!(s.multiplexer_indicator(), can_dbc::MultiplexIndicator::Plain))
}

/// Convert a can-dbc message to our MessageDef
fn convert_message(
    dbc_msg: &can_dbc::Message,
    cycle_time: Option<Duration>,
) -> Result<MessageDef, CatalogError> {
    let raw_id = dbc_msg.message_id().0;
    let is_extended = raw_id & EXTENDED_ID_FLAG != 0;

    let signals = dbc_msg
        .signals()
        .iter()
        .map(convert_signal)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MessageDef {
        id: raw_id & !EXTENDED_ID_FLAG,
        is_extended,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        cycle_time,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
    })
}

/// Convert a can-dbc signal to our SignalDef
fn convert_signal(dbc_sig: &can_dbc::Signal) -> Result<SignalDef, CatalogError> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let start_bit = u16::try_from(*dbc_sig.start_bit()).map_err(|_| {
        CatalogError::InvalidSignal {
            signal: dbc_sig.name().to_string(),
            reason: format!("start bit {} out of range", dbc_sig.start_bit()),
        }
    })?;
    let length = u16::try_from(*dbc_sig.signal_size()).map_err(|_| {
        CatalogError::InvalidSignal {
            signal: dbc_sig.name().to_string(),
            reason: format!("length {} out of range", dbc_sig.signal_size()),
        }
    })?;

    Ok(SignalDef {
        name: dbc_sig.name().to_string(),
        start_bit,
        length,
        byte_order,
        value_type,
        scale: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
    })
}
