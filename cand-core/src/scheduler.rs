//! Transmit scheduler
//!
//! Periodically re-transmits every message that has a cycle time. Each
//! periodic message owns one entry in a fixed table and one task driven by its
//! own interval, so a slow send for one message never delays another.
//!
//! On every tick the entry takes a snapshot of the message from the signal
//! store, encodes it and hands the frame to the transport. Failures are
//! counted and logged, and the next tick simply tries again.

use crate::codec::FrameCodec;
use crate::signals::MessageDef;
use crate::store::SignalStore;
use crate::transport::FrameSender;
use crate::types::{Frame, Timestamp, TransmitError};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a schedule entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    /// Not started, or stopped
    Idle,
    /// Waiting for the next tick
    Armed,
    /// Encoding or sending
    Firing,
}

/// Counters of one periodic message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryStats {
    pub message: String,
    pub id: u32,
    pub cycle_time_ms: u64,
    pub state: ScheduleState,
    pub sent: u64,
    pub encode_failures: u64,
    pub send_failures: u64,
    pub last_fired: Option<Timestamp>,
}

/// Totals over all entries plus on-demand transmissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub entries: usize,
    pub sent: u64,
    pub encode_failures: u64,
    pub send_failures: u64,
    pub on_demand_sent: u64,
    pub on_demand_failures: u64,
}

#[derive(Debug)]
struct EntryState {
    state: ScheduleState,
    sent: u64,
    encode_failures: u64,
    send_failures: u64,
    consecutive_failures: u64,
    last_fired: Option<Timestamp>,
}

#[derive(Debug)]
struct ScheduleEntry {
    message_id: u32,
    cycle_time: Duration,
    state: Mutex<EntryState>,
}

impl ScheduleEntry {
    fn set_state(&self, state: ScheduleState) {
        self.state.lock().state = state;
    }
}

/// Cyclic transmitter for all periodic messages of the catalog
pub struct TransmitScheduler {
    codec: FrameCodec,
    store: Arc<SignalStore>,
    sender: Arc<dyn FrameSender>,
    entries: Vec<ScheduleEntry>,
    index: HashMap<u32, usize>,
    started: AtomicBool,
    on_demand_sent: AtomicU64,
    on_demand_failures: AtomicU64,
}

impl TransmitScheduler {
    /// Build the schedule table from the periodic messages of the codec's catalog
    pub fn new(codec: FrameCodec, store: Arc<SignalStore>, sender: Arc<dyn FrameSender>) -> Self {
        let entries: Vec<ScheduleEntry> = codec
            .catalog()
            .all_periodic_messages()
            .filter_map(|message| {
                message.cycle_time.map(|cycle_time| ScheduleEntry {
                    message_id: message.id,
                    cycle_time,
                    state: Mutex::new(EntryState {
                        state: ScheduleState::Idle,
                        sent: 0,
                        encode_failures: 0,
                        send_failures: 0,
                        consecutive_failures: 0,
                        last_fired: None,
                    }),
                })
            })
            .collect();

        let index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.message_id, i))
            .collect();

        log::debug!("Transmit schedule holds {} periodic messages", entries.len());

        Self {
            codec,
            store,
            sender,
            entries,
            index,
            started: AtomicBool::new(false),
            on_demand_sent: AtomicU64::new(0),
            on_demand_failures: AtomicU64::new(0),
        }
    }

    /// Arm every entry and spawn its task
    ///
    /// The tasks run until `cancel` fires. Calling this a second time does
    /// nothing and returns no handles.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("Transmit scheduler already started");
            return Vec::new();
        }

        (0..self.entries.len())
            .map(|idx| {
                self.entries[idx].set_state(ScheduleState::Armed);
                let scheduler = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { scheduler.run_entry(idx, cancel).await })
            })
            .collect()
    }

    async fn run_entry(&self, idx: usize, cancel: CancellationToken) {
        let entry = &self.entries[idx];
        let mut ticker = interval(entry.cycle_time);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.fire(entry).await;
        }

        entry.set_state(ScheduleState::Idle);
        log::trace!("Schedule for 0x{:X} stopped", entry.message_id);
    }

    async fn fire(&self, entry: &ScheduleEntry) {
        let Some(message) = self.codec.catalog().lookup_message(entry.message_id) else {
            return;
        };

        entry.set_state(ScheduleState::Firing);
        let result = self.transmit(message).await;

        let mut state = entry.state.lock();
        state.state = ScheduleState::Armed;
        state.last_fired = Some(Utc::now());

        match result {
            Ok(_) => {
                state.sent += 1;
                if state.consecutive_failures > 0 {
                    log::info!(
                        "{} transmitting again after {} failed cycles",
                        message.name,
                        state.consecutive_failures
                    );
                    state.consecutive_failures = 0;
                }
            }
            Err(e) => {
                match &e {
                    TransmitError::Encode(_) => state.encode_failures += 1,
                    _ => state.send_failures += 1,
                }
                state.consecutive_failures += 1;
                if state.consecutive_failures == 1 {
                    log::warn!("Cyclic transmit of {} failed: {}", message.name, e);
                } else {
                    log::debug!("Cyclic transmit of {} failed: {}", message.name, e);
                }
            }
        }
    }

    async fn transmit(&self, message: &MessageDef) -> Result<Frame, TransmitError> {
        let values = self.store.snapshot(message.id).unwrap_or_default();
        let frame = self.codec.encode(message, &values)?;
        self.sender.send(&frame).await?;
        log::trace!("TX {}", frame);
        Ok(frame)
    }

    /// Transmit a message right away, outside of its schedule
    ///
    /// Works for every catalog message, periodic or not.
    pub async fn transmit_now(&self, message_id: u32) -> Result<Frame, TransmitError> {
        let message = self
            .codec
            .catalog()
            .lookup_message(message_id)
            .ok_or(TransmitError::UnknownMessage(message_id))?;

        match self.transmit(message).await {
            Ok(frame) => {
                self.on_demand_sent.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(e) => {
                self.on_demand_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// State of the entry for a periodic message
    pub fn state(&self, message_id: u32) -> Option<ScheduleState> {
        let idx = *self.index.get(&message_id)?;
        Some(self.entries[idx].state.lock().state)
    }

    /// Counters of the entry for a periodic message
    pub fn entry_stats(&self, message_id: u32) -> Option<EntryStats> {
        let idx = *self.index.get(&message_id)?;
        let entry = &self.entries[idx];
        let name = self
            .codec
            .catalog()
            .lookup_message(message_id)
            .map(|m| m.name.clone())
            .unwrap_or_default();

        let state = entry.state.lock();
        Some(EntryStats {
            message: name,
            id: message_id,
            cycle_time_ms: u64::try_from(entry.cycle_time.as_millis()).unwrap_or(u64::MAX),
            state: state.state,
            sent: state.sent,
            encode_failures: state.encode_failures,
            send_failures: state.send_failures,
            last_fired: state.last_fired,
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            entries: self.entries.len(),
            on_demand_sent: self.on_demand_sent.load(Ordering::Relaxed),
            on_demand_failures: self.on_demand_failures.load(Ordering::Relaxed),
            ..Default::default()
        };

        for entry in &self.entries {
            let state = entry.state.lock();
            stats.sent += state.sent;
            stats.encode_failures += state.encode_failures;
            stats.send_failures += state.send_failures;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RangePolicy;
    use crate::signals::{Catalog, SignalDef};
    use crate::types::{TransportError, ValueSource};
    use async_trait::async_trait;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingSender {
        frames: Mutex<Vec<(Instant, Frame)>>,
        failing: AtomicBool,
    }

    impl RecordingSender {
        fn frames_for(&self, id: u32) -> Vec<(Instant, Frame)> {
            self.frames
                .lock()
                .iter()
                .filter(|(_, f)| f.id == id)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl FrameSender for RecordingSender {
        async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.frames.lock().push((Instant::now(), frame.clone()));
            Ok(())
        }
    }

    fn setup() -> (Arc<TransmitScheduler>, Arc<SignalStore>, Arc<RecordingSender>) {
        let speed = MessageDef::new(0x100, "VehicleSpeed", 8)
            .with_cycle_time(Duration::from_millis(50))
            .with_signal(
                SignalDef::new("Speed", 0, 16)
                    .with_scaling(0.1, 0.0)
                    .with_range(0.0, 300.0),
            );
        let engine = MessageDef::new(0x123, "EngineData", 8)
            .with_cycle_time(Duration::from_millis(100))
            .with_signal(SignalDef::new("Rpm", 0, 16));
        let door = MessageDef::new(0x200, "DoorCommand", 1).with_signal(SignalDef::new("Lock", 0, 1));

        let catalog = Arc::new(Catalog::new(vec![speed, engine, door]).unwrap());
        let store = Arc::new(SignalStore::new(Arc::clone(&catalog), RangePolicy::Reject));
        let sender = Arc::new(RecordingSender::default());
        let codec = FrameCodec::new(catalog, RangePolicy::Reject);
        let scheduler = Arc::new(TransmitScheduler::new(
            codec,
            Arc::clone(&store),
            Arc::clone(&sender) as Arc<dyn FrameSender>,
        ));

        (scheduler, store, sender)
    }

    async fn stop(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) {
        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_over_ten_seconds() {
        let (scheduler, _store, sender) = setup();
        let cancel = CancellationToken::new();
        let tasks = scheduler.start(cancel.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        stop(cancel, tasks).await;

        let frames = sender.frames_for(0x123);
        assert!(
            (95..=105).contains(&frames.len()),
            "got {} frames",
            frames.len()
        );
        for pair in frames.windows(2) {
            let gap = pair[1].0 - pair[0].0;
            assert!(gap > Duration::ZERO);
            assert!(gap <= Duration::from_millis(200));
        }

        // Event-only messages are never scheduled
        assert!(sender.frames_for(0x200).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_uses_store_snapshot() {
        let (scheduler, store, sender) = setup();
        store.set("Speed", 55.5, ValueSource::Command).unwrap();

        let cancel = CancellationToken::new();
        let tasks = scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop(cancel, tasks).await;

        let frames = sender.frames_for(0x100);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].1.data[..2], &[0x2B, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_and_stats() {
        let (scheduler, _store, _sender) = setup();
        assert_eq!(scheduler.state(0x100), Some(ScheduleState::Idle));
        assert_eq!(scheduler.state(0x200), None);

        let cancel = CancellationToken::new();
        let tasks = scheduler.start(cancel.clone());
        assert!(scheduler.start(cancel.clone()).is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(scheduler.state(0x100), Some(ScheduleState::Armed));
        stop(cancel, tasks).await;
        assert_eq!(scheduler.state(0x100), Some(ScheduleState::Idle));

        let entry = scheduler.entry_stats(0x100).unwrap();
        assert_eq!(entry.message, "VehicleSpeed");
        assert_eq!(entry.cycle_time_ms, 50);
        assert_eq!(entry.sent, 3);
        assert!(entry.last_fired.is_some());

        let stats = scheduler.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.sent, 3 + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_counted_and_recovered() {
        let (scheduler, _store, sender) = setup();
        sender.failing.store(true, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let tasks = scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        sender.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop(cancel, tasks).await;

        let entry = scheduler.entry_stats(0x100).unwrap();
        assert_eq!(entry.send_failures, 3);
        assert_eq!(entry.sent, 2);
    }

    #[tokio::test]
    async fn test_transmit_now() {
        let (scheduler, store, sender) = setup();
        store.set("Lock", 1.0, ValueSource::Command).unwrap();

        let frame = scheduler.transmit_now(0x200).await.unwrap();
        assert_eq!(frame.data, vec![0x01]);
        assert_eq!(sender.frames_for(0x200).len(), 1);

        assert!(matches!(
            scheduler.transmit_now(0x999).await,
            Err(TransmitError::UnknownMessage(0x999))
        ));

        sender.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            scheduler.transmit_now(0x200).await,
            Err(TransmitError::Transport(_))
        ));

        let stats = scheduler.stats();
        assert_eq!(stats.on_demand_sent, 1);
        assert_eq!(stats.on_demand_failures, 1);
        assert_eq!(stats.sent, 0);
    }
}
