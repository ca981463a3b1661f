//! Subscriber entity and slot identity.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::connection::Connection;

/// Stable per-subscriber index, reused after the subscriber is removed.
///
/// The log source echoes this value back on every emit, so it doubles as
/// the sink identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a subscriber.
///
/// ```text
/// Active ──release()──▶ Closing ──▶ Removed
/// ```
///
/// The transition happens exactly once; a removed subscriber is never
/// touched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Admitted and receiving lines
    Active,
    /// Connection being released
    Closing,
    /// Gone from the registry
    Removed,
}

/// Why a subscriber was reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// A write to the subscriber failed or timed out
    SendFailed,
    /// The peer closed its side, or the liveness check declared it dead
    PeerClosed,
    /// The service is shutting down
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RemovalReason::SendFailed => "send failed",
            RemovalReason::PeerClosed => "peer closed",
            RemovalReason::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Subscriber {
    slot: SlotIndex,
    peer: Option<SocketAddr>,
    /// Admission sequence number, used for iteration order
    admitted_seq: u64,
    connection: Arc<Connection>,
    failed: bool,
    state: SubscriberState,
}

impl Subscriber {
    pub(crate) fn new(
        slot: SlotIndex,
        peer: Option<SocketAddr>,
        admitted_seq: u64,
        connection: Connection,
    ) -> Self {
        Self {
            slot,
            peer,
            admitted_seq,
            connection: Arc::new(connection),
            failed: false,
            state: SubscriberState::Active,
        }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Remote address, if it could be read at admission.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriberState::Active
    }

    /// True once a send to this subscriber has failed.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// True once the peer has closed its side of the connection.
    pub fn peer_hung_up(&self) -> bool {
        self.connection.peer_hung_up()
    }

    pub(crate) fn admitted_seq(&self) -> u64 {
        self.admitted_seq
    }

    /// Flags a send failure. Only active subscribers can be flagged; the
    /// flag is never cleared.
    pub(crate) fn mark_failed(&mut self) {
        if self.is_active() {
            self.failed = true;
        }
    }

    /// Releases the connection and moves to `Removed`.
    ///
    /// Called by the registry once the entry has left its map. A second
    /// call is a no-op.
    pub(crate) fn release(&mut self) {
        if !self.is_active() {
            return;
        }
        self.state = SubscriberState::Closing;
        self.connection.close();
        self.state = SubscriberState::Removed;
    }

    /// Reason this subscriber should be reclaimed now, if any.
    pub(crate) fn removal_reason<F>(&self, is_dead: &mut F) -> Option<RemovalReason>
    where
        F: FnMut(&Subscriber) -> bool,
    {
        if self.failed {
            Some(RemovalReason::SendFailed)
        } else if is_dead(self) {
            Some(RemovalReason::PeerClosed)
        } else {
            None
        }
    }
}
