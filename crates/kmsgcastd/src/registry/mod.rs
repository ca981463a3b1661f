//! Subscriber registry.
//!
//! The registry is the single synchronization point between the lifecycle
//! loop (which admits and reclaims subscribers) and the broadcaster (which
//! reads snapshots and flags failures).
//!
//! # Architecture
//!
//! ```text
//!  Server loop ──try_admit / sweep_and_reclaim / drain_all──┐
//!                                                           ▼
//!                                              ┌────────────────────────┐
//!                                              │ Mutex<Inner>           │
//!                                              │  BTreeMap<SlotIndex,   │
//!                                              │           Subscriber>  │
//!                                              └────────────────────────┘
//!                                                           ▲
//!  Broadcaster ──────────────snapshot / mark_failed─────────┘
//! ```
//!
//! # Locking Rules
//!
//! - One `std::sync::Mutex` guards membership and state transitions
//! - The lock is never held across an `.await` or a network send;
//!   `snapshot()` hands out `Arc<Connection>` copies
//! - Reclamation closes connections and deregisters sinks inside the lock;
//!   both are non-blocking
//! - Reclamation collects candidates first and removes them second
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered, not propagated

mod subscriber;

pub use subscriber::{RemovalReason, SlotIndex, Subscriber, SubscriberState};

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::connection::Connection;
use crate::source::{LineSink, LogSource};

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// The connection was stored under this slot
    Admitted(SlotIndex),
    /// The registry is at capacity; the connection is handed back so the
    /// caller can close it
    Full(Connection),
}

/// A subscriber as seen by the broadcaster.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub slot: SlotIndex,
    pub connection: Arc<Connection>,
}

struct Inner {
    subscribers: BTreeMap<SlotIndex, Subscriber>,
    next_seq: u64,
}

/// Bounded, slot-indexed set of active subscribers.
pub struct Registry {
    inner: Mutex<Inner>,
    capacity: usize,
    source: Arc<dyn LogSource>,
}

impl Registry {
    /// Creates an empty registry holding at most `capacity` subscribers.
    ///
    /// `source` is told about every slot that goes away.
    pub fn new(capacity: usize, source: Arc<dyn LogSource>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: BTreeMap::new(),
                next_seq: 0,
            }),
            capacity,
            source,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of active subscribers.
    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Stores `connection` under the lowest free slot.
    ///
    /// At capacity the connection is returned in `Admission::Full`; that is
    /// an expected outcome, not an error. On success the caller should
    /// follow up with [`Registry::register_sink`].
    pub fn try_admit(&self, connection: Connection, peer: Option<SocketAddr>) -> Admission {
        let mut inner = self.lock();

        if inner.subscribers.len() >= self.capacity {
            return Admission::Full(connection);
        }

        let Some(slot) = (0..self.capacity)
            .map(SlotIndex::new)
            .find(|slot| !inner.subscribers.contains_key(slot))
        else {
            return Admission::Full(connection);
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .subscribers
            .insert(slot, Subscriber::new(slot, peer, seq, connection));

        debug!(slot = %slot, count = inner.subscribers.len(), "Admitted subscriber");
        Admission::Admitted(slot)
    }

    /// Registers a sink with the log source for `slot`.
    ///
    /// `make_sink` receives the subscriber's own connection, so the sink can
    /// be bound to this subscriber rather than to the slot number. Runs
    /// under the registry lock so a concurrent reclamation cannot
    /// interleave. Returns false, registering nothing, if the slot is no
    /// longer active.
    pub fn register_sink<F>(&self, slot: SlotIndex, make_sink: F) -> bool
    where
        F: FnOnce(&Arc<Connection>) -> Arc<dyn LineSink>,
    {
        let inner = self.lock();
        match inner.subscribers.get(&slot) {
            Some(sub) if sub.is_active() => {
                self.source.register_sink(slot, make_sink(sub.connection()));
                true
            }
            _ => false,
        }
    }

    /// Copies the active subscribers, in admission order.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        let inner = self.lock();
        let mut subs: Vec<&Subscriber> = inner
            .subscribers
            .values()
            .filter(|sub| sub.is_active())
            .collect();
        subs.sort_by_key(|sub| sub.admitted_seq());

        subs.into_iter()
            .map(|sub| SnapshotEntry {
                slot: sub.slot(),
                connection: Arc::clone(sub.connection()),
            })
            .collect()
    }

    /// Connection for one active slot.
    pub fn connection(&self, slot: SlotIndex) -> Option<Arc<Connection>> {
        self.lock()
            .subscribers
            .get(&slot)
            .filter(|sub| sub.is_active())
            .map(|sub| Arc::clone(sub.connection()))
    }

    /// Active slots, in admission order.
    pub fn slots(&self) -> Vec<SlotIndex> {
        self.snapshot().into_iter().map(|entry| entry.slot).collect()
    }

    /// Peer address recorded for an active slot.
    pub fn peer(&self, slot: SlotIndex) -> Option<SocketAddr> {
        self.lock().subscribers.get(&slot).and_then(Subscriber::peer)
    }

    /// Flags `slot` for reclamation by the next sweep.
    ///
    /// Idempotent; a no-op for slots that are not active.
    pub fn mark_failed(&self, slot: SlotIndex) {
        if let Some(sub) = self.lock().subscribers.get_mut(&slot) {
            sub.mark_failed();
        }
    }

    /// Flags `slot` only if it is still held by the subscriber that owns
    /// `connection`.
    ///
    /// Used by senders working from an older snapshot, so a failure on a
    /// released subscriber never lands on whoever reused its slot.
    pub fn mark_connection_failed(&self, slot: SlotIndex, connection: &Arc<Connection>) {
        if let Some(sub) = self.lock().subscribers.get_mut(&slot) {
            if Arc::ptr_eq(sub.connection(), connection) {
                sub.mark_failed();
            }
        }
    }

    /// Returns true if `slot` is active and flagged as failed.
    pub fn is_failed(&self, slot: SlotIndex) -> bool {
        self.lock()
            .subscribers
            .get(&slot)
            .is_some_and(Subscriber::is_failed)
    }

    /// Reclaims every subscriber that is flagged as failed or for which
    /// `is_dead` returns true.
    ///
    /// Everything happens under one lock acquisition. Returns the
    /// reclaimed slots in admission order.
    pub fn sweep_and_reclaim<F>(&self, mut is_dead: F) -> Vec<SlotIndex>
    where
        F: FnMut(&Subscriber) -> bool,
    {
        let mut inner = self.lock();

        let mut candidates: Vec<(u64, SlotIndex, RemovalReason)> = inner
            .subscribers
            .values()
            .filter(|sub| sub.is_active())
            .filter_map(|sub| {
                sub.removal_reason(&mut is_dead)
                    .map(|reason| (sub.admitted_seq(), sub.slot(), reason))
            })
            .collect();
        candidates.sort_by_key(|(seq, _, _)| *seq);

        candidates
            .into_iter()
            .filter_map(|(_, slot, reason)| self.reclaim(&mut inner, slot, reason))
            .collect()
    }

    /// Reclaims every subscriber. Used at shutdown.
    ///
    /// Returns an empty list, changing nothing, when already empty.
    pub fn drain_all(&self) -> Vec<SlotIndex> {
        let mut inner = self.lock();

        let mut all: Vec<(u64, SlotIndex)> = inner
            .subscribers
            .values()
            .map(|sub| (sub.admitted_seq(), sub.slot()))
            .collect();
        all.sort_unstable();

        all.into_iter()
            .filter_map(|(_, slot)| self.reclaim(&mut inner, slot, RemovalReason::Shutdown))
            .collect()
    }

    /// Removes one subscriber: deregister sink, release connection.
    ///
    /// The sink is torn down before the slot becomes free, so the slot can
    /// never be handed out while the old registration is still live. Leaving
    /// the map is what makes a subscriber `Removed`; `release` records that
    /// on the entry as it goes.
    fn reclaim(
        &self,
        inner: &mut Inner,
        slot: SlotIndex,
        reason: RemovalReason,
    ) -> Option<SlotIndex> {
        let mut sub = inner.subscribers.remove(&slot)?;
        self.source.deregister_sink(slot);
        sub.release();

        match sub.peer() {
            Some(peer) => info!(slot = %slot, peer = %peer, reason = %reason, "Removed subscriber"),
            None => info!(slot = %slot, reason = %reason, "Removed subscriber"),
        }
        Some(slot)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
