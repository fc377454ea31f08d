//! Receive pump
//!
//! Takes frames from the bus transport, decodes them, stores the values and
//! republishes the signals whose value changed.

use crate::bus::{MessageBus, PayloadFormat, SignalUpdate};
use crate::codec::FrameCodec;
use crate::store::SignalStore;
use crate::transport::FrameReceiver;
use crate::types::{DecodeError, Frame, TransportError, ValueSource};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Receive path counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    /// Frames taken from the transport
    pub frames: u64,
    /// Frames decoded successfully
    pub decoded: u64,
    /// Frames whose ID is not in the catalog
    pub unknown: u64,
    /// Frames whose length differs from the catalog
    pub length_mismatch: u64,
    /// Decoded signals outside their declared range
    pub out_of_range: u64,
    /// Decoded signals refused by the store
    pub rejected: u64,
    /// Updates published on the message bus
    pub published: u64,
    /// Updates that could not be published
    pub publish_failures: u64,
    /// Frames lost by the transport
    pub overruns: u64,
    /// Other transport errors
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    decoded: AtomicU64,
    unknown: AtomicU64,
    length_mismatch: AtomicU64,
    out_of_range: AtomicU64,
    rejected: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    overruns: AtomicU64,
    transport_errors: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Bus transport to signal store to message bus
pub struct ReceivePump {
    codec: FrameCodec,
    store: Arc<SignalStore>,
    bus: Arc<dyn MessageBus>,
    topic_prefix: String,
    format: PayloadFormat,
    counters: Counters,
}

impl ReceivePump {
    pub fn new(
        codec: FrameCodec,
        store: Arc<SignalStore>,
        bus: Arc<dyn MessageBus>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            codec,
            store,
            bus,
            topic_prefix: topic_prefix.into(),
            format: PayloadFormat::default(),
            counters: Counters::default(),
        }
    }

    /// Builder method: set the encoding of published updates
    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// Consume frames until the transport closes or `cancel` fires
    pub async fn run(&self, mut receiver: Box<dyn FrameReceiver>, cancel: CancellationToken) {
        log::debug!("Receive pump started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = receiver.recv() => item,
            };

            match item {
                Some(Ok(frame)) => {
                    self.handle_frame(&frame).await;
                }
                Some(Err(TransportError::Overrun(lost))) => {
                    bump(&self.counters.overruns, lost);
                    log::warn!("Receive queue overrun, {} frames lost", lost);
                }
                Some(Err(e)) => {
                    bump(&self.counters.transport_errors, 1);
                    log::warn!("Transport error: {}", e);
                }
                None => {
                    log::info!("Bus transport closed, receive pump stopping");
                    break;
                }
            }
        }

        log::debug!("Receive pump stopped");
    }

    /// Process one received frame
    ///
    /// Returns the number of signals published as changed.
    pub async fn handle_frame(&self, frame: &Frame) -> usize {
        bump(&self.counters.frames, 1);
        log::trace!("RX {}", frame);

        let decoded = match self.codec.decode(frame) {
            Ok(decoded) => decoded,
            Err(DecodeError::UnknownMessage(id)) => {
                bump(&self.counters.unknown, 1);
                log::trace!("Ignoring unknown message 0x{:X}", id);
                return 0;
            }
            Err(e @ DecodeError::LengthMismatch { .. }) => {
                bump(&self.counters.length_mismatch, 1);
                log::warn!("Dropping frame: {}", e);
                return 0;
            }
        };
        bump(&self.counters.decoded, 1);

        for signal in decoded.out_of_range() {
            bump(&self.counters.out_of_range, 1);
            log::debug!(
                "{}.{} decoded out of range: {} (raw {})",
                decoded.message_name,
                signal.name,
                signal.value,
                signal.raw
            );
        }

        let report = self.store.update(
            decoded.id,
            decoded.signals.iter().map(|s| (s.name.as_str(), s.value)),
            ValueSource::Bus,
        );
        for e in &report.rejected {
            bump(&self.counters.rejected, 1);
            log::debug!("Store refused value from 0x{:X}: {}", decoded.id, e);
        }

        let signals: BTreeMap<String, f64> = report
            .changed()
            .map(|change| (change.name.clone(), change.value))
            .collect();
        if signals.is_empty() {
            return 0;
        }

        let count = signals.len();
        let update = SignalUpdate {
            message: decoded.message_name,
            id: decoded.id,
            timestamp: Utc::now(),
            signals,
        };
        let topic = format!("{}.{}", self.topic_prefix, update.message);

        let result = match self.format.encode(&update) {
            Ok(payload) => self.bus.publish(&topic, payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                bump(&self.counters.published, 1);
                count
            }
            Err(e) => {
                bump(&self.counters.publish_failures, 1);
                log::warn!("Failed to publish on {}: {}", topic, e);
                0
            }
        }
    }

    pub fn stats(&self) -> ReceiveStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        ReceiveStats {
            frames: load(&c.frames),
            decoded: load(&c.decoded),
            unknown: load(&c.unknown),
            length_mismatch: load(&c.length_mismatch),
            out_of_range: load(&c.out_of_range),
            rejected: load(&c.rejected),
            published: load(&c.published),
            publish_failures: load(&c.publish_failures),
            overruns: load(&c.overruns),
            transport_errors: load(&c.transport_errors),
        }
    }
}
