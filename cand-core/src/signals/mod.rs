//! Message catalog and DBC loader
//!
//! This module contains the immutable message/signal catalog and the loader
//! that builds it from DBC files.

pub mod catalog;
pub mod dbc;

// Re-export key types for convenience
pub use catalog::{
    ByteOrder, Catalog, CatalogStats, MessageDef, SignalDef, ValueType, MAX_MESSAGE_SIZE,
};
pub use dbc::{load_dbc_file, parse_dbc_file, parse_dbc_str, DbcDefinitions};
