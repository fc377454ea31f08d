//! Command listener
//!
//! Serves signal write and read requests arriving on the message bus. Writes
//! are validated against the catalog, stored with source `Command`, and every
//! event-only message touched by a request is transmitted once afterwards.
//! Periodic messages pick the new values up on their next tick.

use crate::bus::{
    MessageBus, PayloadFormat, QueryReply, QueryRequest, Subscription, WriteReply, WriteRequest,
};
use crate::scheduler::TransmitScheduler;
use crate::signals::Catalog;
use crate::store::SignalStore;
use crate::types::{BusError, ValidationError, ValueSource};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Command path counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    /// Write requests processed
    pub writes: u64,
    /// Read requests processed
    pub queries: u64,
    /// Requests that could not be parsed
    pub invalid_requests: u64,
    /// Signal values stored
    pub accepted: u64,
    /// Signal values refused
    pub rejected: u64,
    /// Event-only messages transmitted on request
    pub transmitted: u64,
    /// Event-only transmissions that failed
    pub transmit_failures: u64,
    /// Replies that could not be published
    pub reply_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    queries: AtomicU64,
    invalid_requests: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    transmitted: AtomicU64,
    transmit_failures: AtomicU64,
    reply_failures: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Subscriptions served by `CommandListener::run`
#[derive(Debug)]
pub struct CommandSubscriptions {
    pub writes: Subscription,
    pub queries: Subscription,
}

/// Message bus to signal store to transmit scheduler
pub struct CommandListener {
    catalog: Arc<Catalog>,
    store: Arc<SignalStore>,
    scheduler: Arc<TransmitScheduler>,
    bus: Arc<dyn MessageBus>,
    tx_topic: String,
    query_topic: String,
    format: PayloadFormat,
    counters: Counters,
}

impl CommandListener {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<SignalStore>,
        scheduler: Arc<TransmitScheduler>,
        bus: Arc<dyn MessageBus>,
        tx_topic: impl Into<String>,
        query_topic: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            store,
            scheduler,
            bus,
            tx_topic: tx_topic.into(),
            query_topic: query_topic.into(),
            format: PayloadFormat::default(),
            counters: Counters::default(),
        }
    }

    /// Builder method: set the encoding of requests and replies
    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// Subscribe to the write and read topics
    pub async fn subscribe(&self) -> Result<CommandSubscriptions, BusError> {
        let writes = self.bus.subscribe(&self.tx_topic).await?;
        let queries = self.bus.subscribe(&self.query_topic).await?;
        log::info!(
            "Listening for writes on {} and reads on {}",
            self.tx_topic,
            self.query_topic
        );
        Ok(CommandSubscriptions { writes, queries })
    }

    /// Serve requests until the message bus closes or `cancel` fires
    pub async fn run(&self, mut subscriptions: CommandSubscriptions, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = subscriptions.writes.recv() => match message {
                    Some(message) => self.handle_write(&message.payload).await,
                    None => break,
                },
                message = subscriptions.queries.recv() => match message {
                    Some(message) => self.handle_query(&message.payload).await,
                    None => break,
                },
            }
        }

        log::debug!("Command listener stopped");
    }

    /// Serve one encoded write request
    pub async fn handle_write(&self, payload: &[u8]) {
        let request: WriteRequest = match self.format.decode(payload) {
            Ok(request) => request,
            Err(e) => {
                bump(&self.counters.invalid_requests, 1);
                log::warn!("Ignoring malformed write request: {}", e);
                return;
            }
        };

        let reply = self.apply_write(&request).await;

        match &request.reply_to {
            Some(reply_to) => self.reply(reply_to, &reply).await,
            None => {
                for (name, reason) in &reply.rejected {
                    log::warn!("Write to {} rejected: {}", name, reason);
                }
            }
        }
    }

    /// Store the values of a write request and transmit touched event-only messages
    pub async fn apply_write(&self, request: &WriteRequest) -> WriteReply {
        bump(&self.counters.writes, 1);
        let mut reply = WriteReply::default();

        // Values of one message are stored together so that a cyclic
        // transmission never sees half of a request
        let mut by_message: BTreeMap<u32, Vec<(&str, f64)>> = BTreeMap::new();
        for (name, &value) in &request.signals {
            match self.catalog.lookup_signal(name) {
                Some((message, _)) => by_message
                    .entry(message.id)
                    .or_default()
                    .push((name.as_str(), value)),
                None => {
                    let e = ValidationError::UnknownSignal(name.clone());
                    reply.rejected.insert(name.clone(), e.to_string());
                }
            }
        }

        let mut to_transmit = Vec::new();
        for (message_id, values) in by_message {
            let report = self.store.update(message_id, values, ValueSource::Command);

            for e in &report.rejected {
                reply.rejected.insert(e.signal().to_string(), e.to_string());
            }
            for change in &report.applied {
                reply.accepted.insert(change.name.clone(), change.value);
            }

            let event_only = self
                .catalog
                .lookup_message(message_id)
                .is_some_and(|m| !m.is_periodic());
            if event_only && !report.applied.is_empty() {
                to_transmit.push(message_id);
            }
        }

        bump(&self.counters.accepted, reply.accepted.len() as u64);
        bump(&self.counters.rejected, reply.rejected.len() as u64);

        for message_id in to_transmit {
            let name = self
                .catalog
                .lookup_message(message_id)
                .map(|m| m.name.clone())
                .unwrap_or_else(|| format!("0x{:X}", message_id));

            match self.scheduler.transmit_now(message_id).await {
                Ok(frame) => {
                    bump(&self.counters.transmitted, 1);
                    log::debug!("Transmitted {} on request: {}", name, frame);
                    reply.transmitted.push(name);
                }
                Err(e) => {
                    bump(&self.counters.transmit_failures, 1);
                    log::error!("Transmit of {} failed: {}", name, e);
                    reply.failed.insert(name, e.to_string());
                }
            }
        }

        reply
    }

    /// Serve one encoded read request
    pub async fn handle_query(&self, payload: &[u8]) {
        let request: QueryRequest = match self.format.decode(payload) {
            Ok(request) => request,
            Err(e) => {
                bump(&self.counters.invalid_requests, 1);
                log::warn!("Ignoring malformed read request: {}", e);
                return;
            }
        };

        let reply = self.query(&request);
        self.reply(&request.reply_to, &reply).await;
    }

    /// Look up the values asked for by a read request
    pub fn query(&self, request: &QueryRequest) -> QueryReply {
        bump(&self.counters.queries, 1);

        if request.signals.is_empty() {
            return QueryReply {
                values: self.store.entries(),
                missing: Vec::new(),
            };
        }

        let mut reply = QueryReply::default();
        for name in &request.signals {
            match self.store.get(name) {
                Some(value) => reply.values.push(value),
                None => reply.missing.push(name.clone()),
            }
        }
        reply
    }

    async fn reply<T: Serialize>(&self, topic: &str, reply: &T) {
        let result = match self.format.encode(reply) {
            Ok(payload) => self.bus.publish(topic, payload).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            bump(&self.counters.reply_failures, 1);
            log::warn!("Failed to send reply on {}: {}", topic, e);
        }
    }

    pub fn stats(&self) -> CommandStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        CommandStats {
            writes: load(&c.writes),
            queries: load(&c.queries),
            invalid_requests: load(&c.invalid_requests),
            accepted: load(&c.accepted),
            rejected: load(&c.rejected),
            transmitted: load(&c.transmitted),
            transmit_failures: load(&c.transmit_failures),
            reply_failures: load(&c.reply_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{from_payload, to_payload, LocalBus};
    use crate::codec::FrameCodec;
    use crate::config::RangePolicy;
    use crate::signals::{MessageDef, SignalDef};
    use crate::transport::{FrameReceiver, FrameSender, VirtualBus, VirtualReceiver};
    use crate::types::{Frame, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Sender whose transport is down
    struct BrokenSender;

    #[async_trait]
    impl FrameSender for BrokenSender {
        async fn send(&self, _frame: &Frame) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    struct Fixture {
        listener: CommandListener,
        store: Arc<SignalStore>,
        bus: Arc<LocalBus>,
        peer: VirtualReceiver,
        _virtual_bus: VirtualBus,
    }

    fn setup() -> Fixture {
        setup_with_sender(None)
    }

    /// Fixture whose scheduler sends through `sender` instead of the virtual bus
    fn setup_with_sender(sender: Option<Arc<dyn FrameSender>>) -> Fixture {
        let speed = MessageDef::new(0x100, "VehicleSpeed", 8)
            .with_cycle_time(Duration::from_millis(50))
            .with_signal(
                SignalDef::new("Speed", 0, 16)
                    .with_scaling(0.1, 0.0)
                    .with_range(0.0, 300.0),
            );
        let door = MessageDef::new(0x200, "DoorCommand", 1)
            .with_signal(SignalDef::new("Lock", 0, 1).with_range(0.0, 1.0))
            .with_signal(SignalDef::new("Window", 1, 2).with_range(0.0, 3.0));

        let catalog = Arc::new(Catalog::new(vec![speed, door]).unwrap());
        let store = Arc::new(SignalStore::new(Arc::clone(&catalog), RangePolicy::Reject));
        let bus = Arc::new(LocalBus::new());

        let virtual_bus = VirtualBus::new(16);
        let (node_sender, _) = virtual_bus.node();
        let (_, peer) = virtual_bus.node();
        let sender = sender.unwrap_or_else(|| Arc::new(node_sender) as Arc<dyn FrameSender>);

        let scheduler = Arc::new(TransmitScheduler::new(
            FrameCodec::new(Arc::clone(&catalog), RangePolicy::Reject),
            Arc::clone(&store),
            sender,
        ));
        let listener = CommandListener::new(
            catalog,
            Arc::clone(&store),
            scheduler,
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            "can.tx",
            "can.query",
        );

        Fixture {
            listener,
            store,
            bus,
            peer,
            _virtual_bus: virtual_bus,
        }
    }

    fn write(signals: &[(&str, f64)]) -> WriteRequest {
        WriteRequest {
            reply_to: None,
            signals: signals.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        }
    }

    #[tokio::test]
    async fn test_write_periodic_signal() {
        let mut fx = setup();

        let reply = fx.listener.apply_write(&write(&[("Speed", 55.5)])).await;
        assert!(reply.is_success());
        assert_eq!(reply.accepted["Speed"], 55.5);
        assert!(reply.transmitted.is_empty());

        let stored = fx.store.get("Speed").unwrap();
        assert_eq!(stored.value, 55.5);
        assert_eq!(stored.source, ValueSource::Command);

        // Periodic messages wait for their tick
        assert!(fx.peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_event_only_message_sent_once_per_request() {
        let mut fx = setup();

        let reply = fx
            .listener
            .apply_write(&write(&[("Lock", 1.0), ("Window", 2.0)]))
            .await;
        assert_eq!(reply.transmitted, vec!["DoorCommand".to_string()]);

        let frame = fx.peer.recv().await.unwrap().unwrap();
        assert_eq!(frame.id, 0x200);
        assert_eq!(frame.data, vec![0b101]);
        assert!(fx.peer.try_recv().is_none());
        assert_eq!(fx.listener.stats().transmitted, 1);
    }

    #[tokio::test]
    async fn test_transmit_failure_reported() {
        let fx = setup_with_sender(Some(Arc::new(BrokenSender) as Arc<dyn FrameSender>));
        let mut replies = fx.bus.subscribe("client.reply").await.unwrap();

        let request = WriteRequest {
            reply_to: Some("client.reply".to_string()),
            ..write(&[("Lock", 1.0)])
        };
        fx.listener
            .handle_write(&to_payload(&request).unwrap())
            .await;

        let reply: WriteReply = from_payload(&replies.recv().await.unwrap().payload).unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.accepted["Lock"], 1.0);
        assert!(reply.transmitted.is_empty());
        assert!(reply.failed["DoorCommand"].contains("closed"));

        // The value stays stored for the next attempt
        assert_eq!(fx.store.get("Lock").unwrap().value, 1.0);

        let stats = fx.listener.stats();
        assert_eq!(stats.transmit_failures, 1);
        assert_eq!(stats.transmitted, 0);
    }

    #[tokio::test]
    async fn test_rejected_values_reported() {
        let mut fx = setup();

        let reply = fx
            .listener
            .apply_write(&write(&[
                ("Speed", 500.0),
                ("Nope", 1.0),
                ("Lock", f64::NAN),
            ]))
            .await;

        assert!(reply.accepted.is_empty());
        assert_eq!(reply.rejected.len(), 3);
        assert!(reply.rejected["Speed"].contains("outside"));
        assert!(reply.rejected["Nope"].contains("not found"));
        assert!(reply.transmitted.is_empty());
        assert!(fx.store.is_empty());
        assert!(fx.peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_write_reply_published() {
        let fx = setup();
        let mut replies = fx.bus.subscribe("client.reply").await.unwrap();

        let request = WriteRequest {
            reply_to: Some("client.reply".to_string()),
            ..write(&[("Speed", 12.3), ("Unknown", 1.0)])
        };
        fx.listener
            .handle_write(&to_payload(&request).unwrap())
            .await;

        let reply: WriteReply = from_payload(&replies.recv().await.unwrap().payload).unwrap();
        assert_eq!(reply.accepted.len(), 1);
        assert_eq!(reply.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_query() {
        let fx = setup();
        fx.store.set("Speed", 10.0, ValueSource::Bus).unwrap();
        let mut replies = fx.bus.subscribe("client.reply").await.unwrap();

        let request = QueryRequest {
            reply_to: "client.reply".to_string(),
            signals: vec!["Speed".to_string(), "Lock".to_string(), "Nope".to_string()],
        };
        fx.listener
            .handle_query(&to_payload(&request).unwrap())
            .await;

        let reply: QueryReply = from_payload(&replies.recv().await.unwrap().payload).unwrap();
        assert_eq!(reply.values.len(), 1);
        assert_eq!(reply.values[0].name, "Speed");
        assert_eq!(reply.missing, vec!["Lock".to_string(), "Nope".to_string()]);

        let everything = fx.listener.query(&QueryRequest {
            reply_to: "x".to_string(),
            signals: Vec::new(),
        });
        assert_eq!(everything.values.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_requests_counted() {
        let fx = setup();
        fx.listener.handle_write(b"{").await;
        fx.listener.handle_query(b"[]").await;
        assert_eq!(fx.listener.stats().invalid_requests, 2);
    }

    #[tokio::test]
    async fn test_run_serves_subscriptions() {
        let fx = setup();
        let subscriptions = fx.listener.subscribe().await.unwrap();
        let mut replies = fx.bus.subscribe("client.reply").await.unwrap();

        let cancel = CancellationToken::new();
        let listener = Arc::new(fx.listener);
        let task = {
            let listener = Arc::clone(&listener);
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(subscriptions, cancel).await })
        };

        let request = WriteRequest {
            reply_to: Some("client.reply".to_string()),
            ..write(&[("Speed", 1.0)])
        };
        fx.bus
            .publish("can.tx", to_payload(&request).unwrap())
            .await
            .unwrap();

        let reply: WriteReply = from_payload(&replies.recv().await.unwrap().payload).unwrap();
        assert!(reply.is_success());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(listener.stats().writes, 1);
    }
}
