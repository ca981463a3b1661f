//! Subscriber lifecycle loop.
//!
//! The server:
//! - Sweeps failed and hung-up subscribers at the top of every iteration
//! - Polls the listener without blocking, backing off when idle or on error
//! - Closes connections that arrive while the registry is full
//! - Admits the rest and registers their slot with the log source
//! - Drains every subscriber and releases the listener on cancellation
//!
//! # Architecture
//!
//! ```text
//!          ┌──────────────────────────────────────────────┐
//!          ▼                                              │
//!   ┌─────────────┐   ┌───────────────┐   ┌─────────────┐ │
//!   │    Sweep    │──▶│ Accept / idle │──▶│ Admit / drop│─┘
//!   └─────────────┘   └───────┬───────┘   └─────────────┘
//!          │                  │ sleep accept_backoff
//!          │ cancelled        └───────────────────────────▶ (repeat)
//!          ▼
//!   ┌─────────────┐
//!   │ Drain, close│──▶ ShutdownReport
//!   └─────────────┘
//! ```
//!
//! The pause after each admission is an admission-rate limit: at most one
//! new subscriber per `admission_interval`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept and admission errors are logged and the loop keeps running

mod listener;

pub use listener::{Listener, TcpAcceptor};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::registry::{Admission, Registry, SlotIndex, Subscriber};
use crate::source::LogSource;

/// Counters collected over the life of the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections admitted as subscribers
    pub admitted: u64,
    /// Connections closed without being admitted
    pub rejected: u64,
    /// Subscribers reclaimed by sweeps
    pub reclaimed: u64,
    /// Slots that were still active at shutdown
    pub drained: Vec<SlotIndex>,
}

/// The lifecycle loop and the state it owns.
pub struct Server<L: Listener> {
    listener: L,
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
    accept_backoff: Duration,
    admission_interval: Duration,
    cancel_token: CancellationToken,
}

impl<L: Listener> Server<L> {
    /// Creates a server around an already-listening `listener`.
    ///
    /// # Arguments
    ///
    /// * `listener` - Bound listener to accept subscribers from
    /// * `source` - Log source that slots are registered with
    /// * `config` - Capacity and timing settings
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        listener: L,
        source: Arc<dyn LogSource>,
        config: &ServerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.max_subscribers, source));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            config.write_timeout(),
        ));

        Self {
            listener,
            registry,
            broadcaster,
            accept_backoff: config.accept_backoff(),
            admission_interval: config.admission_interval(),
            cancel_token,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// Spawns the loop on the current runtime.
    pub fn spawn(self) -> ServerHandle {
        let registry = self.registry();
        let broadcaster = self.broadcaster();
        let cancel_token = self.cancel_token.clone();
        let join = tokio::spawn(self.run());

        ServerHandle {
            join,
            registry,
            broadcaster,
            cancel_token,
        }
    }

    /// Runs the loop until the cancellation token fires.
    ///
    /// Returns only after every subscriber has been drained and the
    /// listener released.
    pub async fn run(mut self) -> ShutdownReport {
        info!(
            capacity = self.registry.capacity(),
            accept_backoff_ms = self.accept_backoff.as_millis() as u64,
            admission_interval_ms = self.admission_interval.as_millis() as u64,
            "Lifecycle loop started"
        );

        let mut report = ShutdownReport::default();

        while !self.cancel_token.is_cancelled() {
            let reclaimed = self.registry.sweep_and_reclaim(Subscriber::peer_hung_up);
            if !reclaimed.is_empty() {
                report.reclaimed += reclaimed.len() as u64;
                debug!(
                    reclaimed = ?reclaimed,
                    remaining = self.registry.len(),
                    "Swept subscribers"
                );
            }

            let stream = match self.listener.accept_nonblocking() {
                Ok(Some(stream)) => stream,
                Ok(None) => {
                    if !pause(&self.cancel_token, self.accept_backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    let err = ServerError::Accept(e.to_string());
                    warn!(error = %err, "Failed to accept connection");
                    if !pause(&self.cancel_token, self.accept_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let delay = match self.admit(stream) {
                Ok(_) => {
                    report.admitted += 1;
                    self.admission_interval
                }
                Err(e @ ServerError::CapacityExceeded { .. }) => {
                    report.rejected += 1;
                    warn!(error = %e, "Rejected connection");
                    self.accept_backoff
                }
                Err(e) => {
                    report.rejected += 1;
                    warn!(error = %e, "Dropped connection");
                    continue;
                }
            };

            if !pause(&self.cancel_token, delay).await {
                break;
            }
        }

        info!("Lifecycle loop shutdown requested");

        report.drained = self.registry.drain_all();
        self.listener.close();

        info!(
            drained = report.drained.len(),
            admitted = report.admitted,
            rejected = report.rejected,
            "Lifecycle loop stopped"
        );
        report
    }

    /// Admits one accepted connection, or closes it.
    fn admit(&self, stream: L::Stream) -> Result<SlotIndex, ServerError> {
        let peer: Option<SocketAddr> = match self.listener.peer_address(&stream) {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!(error = %e, "Could not read peer address");
                None
            }
        };

        let max = self.registry.capacity();
        if self.registry.is_full() {
            drop(stream);
            debug!(peer = ?peer, "Closed connection at capacity");
            return Err(ServerError::CapacityExceeded { max });
        }

        let stream = self
            .listener
            .into_async(stream)
            .map_err(|e| ServerError::AdmissionResource(e.to_string()))?;

        let slot = match self.registry.try_admit(Connection::new(stream), peer) {
            Admission::Admitted(slot) => slot,
            Admission::Full(_connection) => return Err(ServerError::CapacityExceeded { max }),
        };

        let registered = self.registry.register_sink(slot, |connection| {
            self.broadcaster.subscriber_sink(Arc::clone(connection))
        });
        if !registered {
            debug!(slot = %slot, "Subscriber left before its sink was registered");
        }

        match peer {
            Some(peer) => info!(slot = %slot, peer = %peer, "Accepted connection"),
            None => info!(slot = %slot, "Accepted connection"),
        }
        Ok(slot)
    }
}

/// Sleeps for `duration`. Returns false if cancelled meanwhile.
async fn pause(cancel_token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel_token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Handle to a spawned lifecycle loop.
#[derive(Debug)]
pub struct ServerHandle {
    join: JoinHandle<ShutdownReport>,
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
    cancel_token: CancellationToken,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Waits for the loop to finish on its own (after external cancellation).
    pub async fn wait(self) -> Result<ShutdownReport, ServerError> {
        self.join
            .await
            .map_err(|e| ServerError::TaskFailed(e.to_string()))
    }

    /// Requests shutdown and waits for drain and listener release.
    pub async fn shutdown(self) -> Result<ShutdownReport, ServerError> {
        self.cancel_token.cancel();
        self.wait().await
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Too many subscribers (max: {max})")]
    CapacityExceeded { max: usize },

    #[error("Accept failed: {0}")]
    Accept(String),

    #[error("Failed to set up subscriber connection: {0}")]
    AdmissionResource(String),

    #[error("Lifecycle task failed: {0}")]
    TaskFailed(String),
}
