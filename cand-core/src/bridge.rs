//! Bridge orchestration
//!
//! Wires the catalog, codec, store, scheduler and both pumps together and
//! owns their long-lived tasks.

use crate::bus::MessageBus;
use crate::codec::FrameCodec;
use crate::command::{CommandListener, CommandStats};
use crate::config::BridgeConfig;
use crate::receive::{ReceivePump, ReceiveStats};
use crate::scheduler::{SchedulerStats, TransmitScheduler};
use crate::signals::{Catalog, CatalogStats};
use crate::store::SignalStore;
use crate::transport::{FrameReceiver, FrameSender};
use crate::types::BusError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Snapshot of every counter of the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStats {
    pub catalog: CatalogStats,
    pub stored_signals: usize,
    pub receive: ReceiveStats,
    pub command: CommandStats,
    pub scheduler: SchedulerStats,
}

/// The CAN to message-bus bridge
pub struct Bridge {
    config: BridgeConfig,
    catalog: Arc<Catalog>,
    store: Arc<SignalStore>,
    scheduler: Arc<TransmitScheduler>,
    receive: Arc<ReceivePump>,
    command: Arc<CommandListener>,
    bus: Arc<dyn MessageBus>,
}

impl Bridge {
    pub fn new(
        catalog: Arc<Catalog>,
        config: BridgeConfig,
        sender: Arc<dyn FrameSender>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let policy = config.range_policy;
        let codec = FrameCodec::new(Arc::clone(&catalog), policy);
        let store = Arc::new(SignalStore::new(Arc::clone(&catalog), policy));

        let scheduler = Arc::new(TransmitScheduler::new(
            codec.clone(),
            Arc::clone(&store),
            sender,
        ));
        let receive = Arc::new(ReceivePump::new(
            codec,
            Arc::clone(&store),
            Arc::clone(&bus),
            config.rx_topic_prefix.clone(),
        )
        .with_payload_format(config.payload_format));
        let command = Arc::new(CommandListener::new(
            Arc::clone(&catalog),
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&bus),
            config.tx_topic.clone(),
            config.query_topic.clone(),
        )
        .with_payload_format(config.payload_format));

        Self {
            config,
            catalog,
            store,
            scheduler,
            receive,
            command,
            bus,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<SignalStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<TransmitScheduler> {
        &self.scheduler
    }

    pub fn receive_pump(&self) -> &Arc<ReceivePump> {
        &self.receive
    }

    pub fn command_listener(&self) -> &Arc<CommandListener> {
        &self.command
    }

    /// Start every task of the bridge
    ///
    /// The command topics are subscribed before any task runs, so no request
    /// published after this returns is missed.
    pub async fn start(
        self: &Arc<Self>,
        receiver: Box<dyn FrameReceiver>,
    ) -> Result<BridgeHandle, BusError> {
        let subscriptions = self.command.subscribe().await?;
        let cancel = CancellationToken::new();

        let mut tasks = self.scheduler.start(cancel.clone());

        let pump = Arc::clone(&self.receive);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move { pump.run(receiver, token).await }));

        let command = Arc::clone(&self.command);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            command.run(subscriptions, token).await
        }));

        if let Some(ms) = self.config.status_interval_ms.filter(|&ms| ms > 0) {
            let bridge = Arc::clone(self);
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                bridge.publish_status(Duration::from_millis(ms), token).await
            }));
        }

        let stats = self.catalog.stats();
        log::info!(
            "Bridge started: {} messages, {} signals, {} periodic",
            stats.num_messages,
            stats.num_signals,
            stats.num_periodic
        );

        Ok(BridgeHandle { cancel, tasks })
    }

    async fn publish_status(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = match self.config.payload_format.encode(&self.stats()) {
                Ok(payload) => self.bus.publish(&self.config.status_topic, payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                log::warn!("Failed to publish status: {}", e);
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            catalog: self.catalog.stats(),
            stored_signals: self.store.len(),
            receive: self.receive.stats(),
            command: self.command.stats(),
            scheduler: self.scheduler.stats(),
        }
    }
}

/// Running bridge tasks
#[derive(Debug)]
pub struct BridgeHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Token that stops the bridge when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for it to finish its current unit of work
    pub async fn shutdown(self) {
        log::info!("Stopping bridge");
        self.cancel.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Bridge task failed: {}", e);
            }
        }

        log::info!("Bridge stopped");
    }
}
