//! CAN bridge library
//!
//! Translates between raw CAN frames and named signal values defined by a
//! DBC catalog, and connects a CAN bus to a publish/subscribe message bus.
//!
//! # Architecture
//!
//! - Message catalog: immutable message and signal table, loaded once
//! - Frame codec: pure encode/decode between frames and physical values
//! - Signal store: latest value per signal, shared by all tasks
//! - Transmit scheduler: cyclic transmission of every periodic message
//! - Receive pump: bus frames are decoded, stored and republished on change
//! - Command listener: write and read requests from the message bus
//!
//! The bus transport and the message bus are traits; `VirtualBus` and
//! `LocalBus` are in-process implementations. A SocketCAN transport is
//! available behind the `socketcan` feature and a Redis message bus behind
//! the `redis` feature. Payloads are JSON or MessagePack (`PayloadFormat`).
//!
//! # Example Usage
//!
//! ```no_run
//! use cand_core::{load_dbc_file, Bridge, BridgeConfig, LocalBus, VirtualBus};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = Arc::new(load_dbc_file(Path::new("vehicle.dbc"))?);
//! let can = VirtualBus::default();
//! let (sender, receiver) = can.node();
//!
//! let bridge = Arc::new(Bridge::new(
//!     catalog,
//!     BridgeConfig::new(),
//!     Arc::new(sender),
//!     Arc::new(LocalBus::new()),
//! ));
//! let handle = bridge.start(Box::new(receiver)).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod bridge;
pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod receive;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use bridge::{Bridge, BridgeHandle, BridgeStats};
pub use bus::{BusMessage, LocalBus, MessageBus, PayloadFormat, Subscription};
#[cfg(feature = "redis")]
pub use bus::RedisBus;
pub use codec::{DecodedFrame, DecodedSignal, FrameCodec};
pub use command::{CommandListener, CommandStats};
pub use config::{BridgeConfig, RangePolicy};
pub use receive::{ReceivePump, ReceiveStats};
pub use scheduler::{ScheduleState, SchedulerStats, TransmitScheduler};
pub use signals::{
    load_dbc_file, parse_dbc_file, parse_dbc_str, Catalog, DbcDefinitions, MessageDef, SignalDef,
};
pub use store::SignalStore;
pub use transport::{FrameReceiver, FrameSender, VirtualBus};
pub use types::{
    BusError, CatalogError, DecodeError, EncodeError, Frame, SignalMap, SignalValue, Timestamp,
    TransmitError, TransportError, ValidationError, ValueSource,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
