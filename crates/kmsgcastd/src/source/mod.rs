//! Log source boundary.
//!
//! The daemon does not care where log lines come from. A log source only
//! has to accept per-slot sink registrations and invoke each registered
//! sink once per emitted line, echoing back the slot it was registered
//! under.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish(line)  ┌──────────────┐  emit(slot, line)  ┌─────────────────┐
//! │ kmsg reader  │────────────────▶│    LogHub    │───────────────────▶│ subscriber sink │
//! │ / LineSender │                 │ slot -> sink │   (per slot)       │ (one per conn)  │
//! └──────────────┘                 └──────────────┘                    └─────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - `register_sink`/`deregister_sink` are synchronous and short, so the
//!   registry can call them while holding its own lock
//! - The hub never holds its lock across an `.await`
//! - A line is never handed to a slot whose deregistration completed before
//!   the line was published

mod kmsg;
mod pump;

pub use kmsg::{format_kmsg_record, KmsgRecord};
pub use pump::{pump_reader, spawn_pump, LineSender, PumpStats, DEFAULT_PUMP_CAPACITY};

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::registry::SlotIndex;

/// Receiver of log lines for one registered slot.
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Delivers one line. `slot` is the index the sink was registered under.
    ///
    /// Must not fail: delivery problems are handled inside the sink.
    async fn emit(&self, slot: SlotIndex, line: &[u8]);
}

/// A producer of log lines that routes them to registered sinks.
pub trait LogSource: Send + Sync {
    /// Registers `sink` for `slot`, replacing any previous registration.
    fn register_sink(&self, slot: SlotIndex, sink: Arc<dyn LineSink>);

    /// Removes the registration for `slot`. No-op if none exists.
    fn deregister_sink(&self, slot: SlotIndex);
}

/// In-process log source: fans each published line out to every
/// registered sink.
#[derive(Default)]
pub struct LogHub {
    sinks: RwLock<BTreeMap<SlotIndex, Arc<dyn LineSink>>>,
}

impl LogHub {
    /// Creates a hub with no registered sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes one line to every currently registered sink.
    ///
    /// Returns the number of sinks the line was handed to.
    pub async fn publish(&self, line: &[u8]) -> usize {
        // Copy the registrations so no lock is held while sinks do I/O
        let targets: Vec<(SlotIndex, Arc<dyn LineSink>)> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(slot, sink)| (*slot, Arc::clone(sink)))
            .collect();

        trace!(bytes = line.len(), sinks = targets.len(), "Publishing line");

        for (slot, sink) in &targets {
            sink.emit(*slot, line).await;
        }

        targets.len()
    }

    /// Returns the number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if a sink is registered for `slot`.
    pub fn is_registered(&self, slot: SlotIndex) -> bool {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&slot)
    }
}

impl LogSource for LogHub {
    fn register_sink(&self, slot: SlotIndex, sink: Arc<dyn LineSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        if sinks.insert(slot, sink).is_some() {
            debug!(slot = %slot, "Replaced existing sink registration");
        } else {
            debug!(slot = %slot, "Registered sink");
        }
    }

    fn deregister_sink(&self, slot: SlotIndex) {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        if sinks.remove(&slot).is_some() {
            debug!(slot = %slot, "Deregistered sink");
        }
    }
}

impl std::fmt::Debug for LogHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHub")
            .field("sinks", &self.sink_count())
            .finish()
    }
}
