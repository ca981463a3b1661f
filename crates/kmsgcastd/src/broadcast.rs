//! Broadcast emitter: fans a log line out to active subscribers.
//!
//! `emit` works from a registry snapshot, so no registry lock is held while
//! writing. A failed or timed-out write flags that one subscriber and
//! delivery continues with the rest; nothing is reported back to the log
//! source.
//!
//! Log source registrations go through [`Broadcaster::subscriber_sink`],
//! which binds each registration to the subscriber's own connection
//! rather than to its slot number.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Send failures are logged and recorded, never propagated

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::DEFAULT_WRITE_TIMEOUT_MS;
use crate::connection::Connection;
use crate::registry::{Registry, SlotIndex};
use crate::source::LineSink;

/// Outcome of one `emit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Subscribers that received the whole line
    pub delivered: usize,
    /// Subscribers flagged as failed by this call
    pub failed: usize,
}

/// Writes log lines to subscribers.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    write_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Creates a broadcaster with the default write timeout.
    pub fn with_default_timeout(registry: Arc<Registry>) -> Self {
        Self::new(registry, Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Writes `line` to every active subscriber, in admission order.
    pub async fn emit(&self, line: &[u8]) -> EmitReport {
        let mut report = EmitReport::default();

        for entry in self.registry.snapshot() {
            if self.send(entry.slot, &entry.connection, line).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Builds the sink to register for one admitted subscriber.
    ///
    /// The sink writes to `connection` only. Once that subscriber is
    /// released its lines are dropped, even if the slot has already been
    /// handed to someone else.
    pub fn subscriber_sink(self: &Arc<Self>, connection: Arc<Connection>) -> Arc<dyn LineSink> {
        Arc::new(SubscriberSink {
            broadcaster: Arc::clone(self),
            connection,
        })
    }

    /// Writes one line to one connection. Returns true if it was delivered.
    async fn send(&self, slot: SlotIndex, connection: &Arc<Connection>, line: &[u8]) -> bool {
        match connection.write_line(line, self.write_timeout).await {
            Ok(()) => true,
            Err(SendError::Closed) => false,
            Err(e) => {
                debug!(slot = %slot, error = %e, "Failed to send line to subscriber");
                self.registry.mark_connection_failed(slot, connection);
                false
            }
        }
    }
}

/// Log source registration for a single subscriber.
struct SubscriberSink {
    broadcaster: Arc<Broadcaster>,
    connection: Arc<Connection>,
}

#[async_trait]
impl LineSink for SubscriberSink {
    async fn emit(&self, slot: SlotIndex, line: &[u8]) {
        self.broadcaster.send(slot, &self.connection, line).await;
    }
}

/// Errors from a single subscriber write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}
