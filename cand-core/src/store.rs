//! Signal store
//!
//! Latest known physical value of every signal, shared by the receive pump,
//! the command listener and the transmit scheduler.
//!
//! Values are grouped per message behind one lock each: a snapshot of a
//! message and a multi-signal update of the same message are atomic with
//! respect to each other, while writes to different messages never contend.
//! Concurrent writes to two signals of the same message do serialize on that
//! message's lock; the critical section is a few field assignments and never
//! spans I/O, so a writer waits at most for one other write or snapshot.
//! Callers only ever get copies of stored values.

use crate::config::RangePolicy;
use crate::signals::{Catalog, SignalDef};
use crate::types::{SignalMap, SignalValue, Timestamp, ValidationError, ValueSource};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct StoredEntry {
    value: f64,
    timestamp: Timestamp,
    source: ValueSource,
}

/// Values of one message, indexed like `MessageDef::signals`
#[derive(Debug)]
struct MessageSlot {
    values: Vec<Option<StoredEntry>>,
}

/// Outcome of writing one signal through `SignalStore::update`
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    /// Signal name
    pub name: String,
    /// Value now stored
    pub value: f64,
    /// Value stored before this write, if any
    pub previous: Option<f64>,
    /// True if the signal was new or moved by at least half a scale step
    pub changed: bool,
}

/// Result of a multi-signal update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateReport {
    /// Signals that were written
    pub applied: Vec<StoreChange>,
    /// Signals refused by validation
    pub rejected: Vec<ValidationError>,
}

impl UpdateReport {
    /// Written signals whose value changed
    pub fn changed(&self) -> impl Iterator<Item = &StoreChange> {
        self.applied.iter().filter(|c| c.changed)
    }
}

/// Thread-safe cache of the latest value per signal
#[derive(Debug)]
pub struct SignalStore {
    catalog: Arc<Catalog>,
    policy: RangePolicy,
    slots: Vec<RwLock<MessageSlot>>,
}

impl SignalStore {
    pub fn new(catalog: Arc<Catalog>, policy: RangePolicy) -> Self {
        let slots = catalog
            .messages()
            .iter()
            .map(|m| {
                RwLock::new(MessageSlot {
                    values: vec![None; m.signals.len()],
                })
            })
            .collect();

        Self {
            catalog,
            policy,
            slots,
        }
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// Latest value of a signal, `None` if unknown or never set
    pub fn get(&self, name: &str) -> Option<SignalValue> {
        let (msg_idx, sig_idx) = self.catalog.signal_index(name)?;
        let entry = self.slots[msg_idx].read().values[sig_idx]?;

        Some(SignalValue {
            name: name.to_string(),
            value: entry.value,
            timestamp: entry.timestamp,
            source: entry.source,
        })
    }

    /// Write one signal
    ///
    /// Returns the value actually stored, which differs from `value` only when
    /// the clamp policy brought it into range.
    pub fn set(&self, name: &str, value: f64, source: ValueSource) -> Result<f64, ValidationError> {
        let (msg_idx, sig_idx) = self
            .catalog
            .signal_index(name)
            .ok_or_else(|| ValidationError::UnknownSignal(name.to_string()))?;

        let signal = &self.catalog.messages()[msg_idx].signals[sig_idx];
        let value = self.validate(signal, value)?;

        self.slots[msg_idx].write().values[sig_idx] = Some(StoredEntry {
            value,
            timestamp: Utc::now(),
            source,
        });

        Ok(value)
    }

    /// Write several signals of one message in a single critical section
    ///
    /// Values are validated before the lock is taken; refused or foreign
    /// signals are reported in `rejected` and do not prevent the others from
    /// being written.
    pub fn update<'a, I>(&self, message_id: u32, values: I, source: ValueSource) -> UpdateReport
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut report = UpdateReport::default();

        let Some(msg_idx) = self.catalog.message_index(message_id) else {
            report.rejected.extend(
                values
                    .into_iter()
                    .map(|(name, _)| ValidationError::UnknownSignal(name.to_string())),
            );
            return report;
        };
        let message = &self.catalog.messages()[msg_idx];

        let mut accepted = Vec::new();
        for (name, value) in values {
            match self.catalog.signal_index(name) {
                Some((m, sig_idx)) if m == msg_idx => {
                    match self.validate(&message.signals[sig_idx], value) {
                        Ok(value) => accepted.push((sig_idx, value)),
                        Err(e) => report.rejected.push(e),
                    }
                }
                _ => report
                    .rejected
                    .push(ValidationError::UnknownSignal(name.to_string())),
            }
        }

        let timestamp = Utc::now();
        let mut slot = self.slots[msg_idx].write();

        for (sig_idx, value) in accepted {
            let signal = &message.signals[sig_idx];
            let previous = slot.values[sig_idx].map(|e| e.value);
            let changed = previous.map_or(true, |p| (value - p).abs() >= signal.change_threshold());

            slot.values[sig_idx] = Some(StoredEntry {
                value,
                timestamp,
                source,
            });

            report.applied.push(StoreChange {
                name: signal.name.clone(),
                value,
                previous,
                changed,
            });
        }

        report
    }

    /// Current values of every set signal of a message, taken atomically
    ///
    /// Returns `None` if the message is not in the catalog.
    pub fn snapshot(&self, message_id: u32) -> Option<SignalMap> {
        let msg_idx = self.catalog.message_index(message_id)?;
        let message = &self.catalog.messages()[msg_idx];
        let slot = self.slots[msg_idx].read();

        Some(
            message
                .signals
                .iter()
                .zip(slot.values.iter())
                .filter_map(|(signal, entry)| entry.map(|e| (signal.name.clone(), e.value)))
                .collect(),
        )
    }

    /// Copies of every stored value, in catalog order
    pub fn entries(&self) -> Vec<SignalValue> {
        let mut entries = Vec::new();

        for (message, slot) in self.catalog.messages().iter().zip(&self.slots) {
            let slot = slot.read();
            for (signal, entry) in message.signals.iter().zip(slot.values.iter()) {
                if let Some(e) = entry {
                    entries.push(SignalValue {
                        name: signal.name.clone(),
                        value: e.value,
                        timestamp: e.timestamp,
                        source: e.source,
                    });
                }
            }
        }

        entries
    }

    /// Number of signals that have a value
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.read().values.iter().filter(|v| v.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, signal: &SignalDef, value: f64) -> Result<f64, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NonFinite(signal.name.clone()));
        }

        self.policy
            .apply(signal, value)
            .map_err(|(min, max)| ValidationError::OutOfRange {
                signal: signal.name.clone(),
                value,
                min,
                max,
            })
    }
}
