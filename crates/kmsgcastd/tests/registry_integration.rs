//! Integration tests for the subscriber registry and broadcaster.
//!
//! These tests drive `Registry`, `Broadcaster` and `LogHub` together
//! through their public interfaces, using in-memory duplex streams as
//! subscriber connections.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kmsgcastd::registry::{Admission, Registry, SlotIndex};
use kmsgcastd::source::{LineSink, LogHub, LogSource};
use kmsgcastd::{Broadcaster, Connection};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

const WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const PIPE_SIZE: usize = 64 * 1024;

struct Fixture {
    hub: Arc<LogHub>,
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
}

impl Fixture {
    fn new(capacity: usize) -> Self {
        let hub = Arc::new(LogHub::new());
        let registry = Arc::new(Registry::new(capacity, hub.clone()));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), WRITE_TIMEOUT));
        Self {
            hub,
            registry,
            broadcaster,
        }
    }

    /// Admits a subscriber and registers its sink, as the server loop does.
    fn admit(&self) -> (SlotIndex, DuplexStream) {
        admit_subscriber(&self.registry, &self.broadcaster)
    }

    fn remove(&self, slot: SlotIndex) -> Vec<SlotIndex> {
        self.registry.mark_failed(slot);
        self.registry.sweep_and_reclaim(|_| false)
    }
}

fn admit_subscriber(
    registry: &Registry,
    broadcaster: &Arc<Broadcaster>,
) -> (SlotIndex, DuplexStream) {
    let (server, client) = duplex(PIPE_SIZE);
    let slot = match registry.try_admit(Connection::new(server), None) {
        Admission::Admitted(slot) => slot,
        Admission::Full(_) => panic!("registry unexpectedly full"),
    };
    assert!(registry.register_sink(slot, |conn| {
        broadcaster.subscriber_sink(Arc::clone(conn))
    }));
    (slot, client)
}

async fn read_exact(client: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(1), client.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

async fn read_available(client: &mut DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    while let Ok(Ok(n)) = timeout(Duration::from_millis(50), client.read(&mut buf)).await {
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

// ============================================================================
// Fan-Out
// ============================================================================

#[tokio::test]
async fn test_fan_out_completes_despite_failed_subscriber() {
    let fx = Fixture::new(10);
    let (_s1, mut c1) = fx.admit();
    let (s2, c2) = fx.admit();
    let (_s3, mut c3) = fx.admit();

    drop(c2);

    let report = fx.broadcaster.emit(b"line").await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);

    assert_eq!(read_exact(&mut c1, 4).await, b"line");
    assert_eq!(read_exact(&mut c3, 4).await, b"line");
    assert!(fx.registry.is_failed(s2));
}

#[tokio::test]
async fn test_fan_out_through_hub_completes_despite_failed_subscriber() {
    let fx = Fixture::new(10);
    let (_s1, mut c1) = fx.admit();
    let (s2, c2) = fx.admit();
    let (_s3, mut c3) = fx.admit();

    drop(c2);

    assert_eq!(fx.hub.publish(b"line").await, 3);
    assert_eq!(read_exact(&mut c1, 4).await, b"line");
    assert_eq!(read_exact(&mut c3, 4).await, b"line");
    assert!(fx.registry.is_failed(s2));

    assert_eq!(fx.registry.sweep_and_reclaim(|_| false), vec![s2]);
    assert!(!fx.hub.is_registered(s2));
}

// ============================================================================
// Slot Reuse
// ============================================================================

#[tokio::test]
async fn test_slot_reuse_delivers_only_post_admission_lines() {
    let fx = Fixture::new(10);

    let (a, mut client_a) = fx.admit();
    assert_eq!(a, SlotIndex::new(0));
    fx.hub.publish(b"for A\n").await;
    assert_eq!(read_exact(&mut client_a, 6).await, b"for A\n");

    assert_eq!(fx.remove(a), vec![a]);
    fx.hub.publish(b"nobody\n").await;

    let (b, mut client_b) = fx.admit();
    assert_eq!(b, SlotIndex::new(0));
    fx.hub.publish(b"for B\n").await;

    assert_eq!(read_available(&mut client_b).await, b"for B\n");
    // A's connection was released; it saw nothing after its removal
    assert_eq!(read_available(&mut client_a).await, b"");
}

/// Sink that, on the first line it sees, reclaims `victim` and admits a
/// new subscriber, which reuses that slot.
struct SlotReusingSink {
    registry: Arc<Registry>,
    broadcaster: Arc<Broadcaster>,
    victim: SlotIndex,
    reused: AtomicBool,
    newcomer: Mutex<Option<(SlotIndex, DuplexStream)>>,
}

#[async_trait]
impl LineSink for SlotReusingSink {
    async fn emit(&self, _slot: SlotIndex, _line: &[u8]) {
        if self.reused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.mark_failed(self.victim);
        assert_eq!(self.registry.sweep_and_reclaim(|_| false), vec![self.victim]);
        let admitted = admit_subscriber(&self.registry, &self.broadcaster);
        *self.newcomer.lock().unwrap() = Some(admitted);
    }
}

#[tokio::test]
async fn test_slot_reused_during_publish_misses_in_flight_line() {
    let fx = Fixture::new(2);

    // Slot 0 goes first in every publish and reuses slot 1 mid-flight
    let (first, _keep) = duplex(PIPE_SIZE);
    let reuser_slot = match fx.registry.try_admit(Connection::new(first), None) {
        Admission::Admitted(slot) => slot,
        Admission::Full(_) => panic!("registry unexpectedly full"),
    };
    let (victim, mut client_a) = fx.admit();
    assert_eq!((reuser_slot, victim), (SlotIndex::new(0), SlotIndex::new(1)));

    let reuser = Arc::new(SlotReusingSink {
        registry: fx.registry.clone(),
        broadcaster: fx.broadcaster.clone(),
        victim,
        reused: AtomicBool::new(false),
        newcomer: Mutex::new(None),
    });
    assert!(fx.registry.register_sink(reuser_slot, |_| {
        Arc::clone(&reuser) as Arc<dyn LineSink>
    }));

    // The hub copied A's registration before slot 1 changed hands
    assert_eq!(fx.hub.publish(b"OLD LINE\n").await, 2);

    let (slot_b, mut client_b) = reuser.newcomer.lock().unwrap().take().unwrap();
    assert_eq!(slot_b, victim);
    assert!(!fx.registry.is_failed(slot_b));

    fx.hub.publish(b"NEW LINE\n").await;
    assert_eq!(read_available(&mut client_b).await, b"NEW LINE\n");
    assert_eq!(read_available(&mut client_a).await, b"");
}

#[tokio::test]
async fn test_freed_slot_is_lowest_available() {
    let fx = Fixture::new(10);
    let slots: Vec<_> = (0..4).map(|_| fx.admit()).collect();

    fx.remove(slots[2].0);
    fx.remove(slots[1].0);

    let (next, _c) = fx.admit();
    assert_eq!(next, SlotIndex::new(1));
    let (after, _c2) = fx.admit();
    assert_eq!(after, SlotIndex::new(2));
    let (fresh, _c3) = fx.admit();
    assert_eq!(fresh, SlotIndex::new(4));
}

// ============================================================================
// Removal and Drain
// ============================================================================

#[tokio::test]
async fn test_no_double_removal() {
    let fx = Fixture::new(10);
    let (a, _ca) = fx.admit();
    let (b, _cb) = fx.admit();

    fx.registry.mark_failed(a);
    assert_eq!(fx.registry.sweep_and_reclaim(|_| true), vec![a, b]);

    assert!(fx.registry.snapshot().is_empty());
    assert!(fx.registry.sweep_and_reclaim(|_| true).is_empty());
    assert!(fx.registry.drain_all().is_empty());
}

#[tokio::test]
async fn test_drain_all_is_idempotent() {
    let fx = Fixture::new(3);
    assert!(fx.registry.drain_all().is_empty());

    let (a, _ca) = fx.admit();
    let (b, _cb) = fx.admit();
    assert_eq!(fx.registry.drain_all(), vec![a, b]);
    assert!(fx.registry.drain_all().is_empty());
    assert!(fx.registry.is_empty());
    assert_eq!(fx.hub.sink_count(), 0);
}

#[tokio::test]
async fn test_capacity_invariant_with_churn() {
    let fx = Fixture::new(3);
    let mut clients = Vec::new();

    for round in 0..30 {
        let (server, client) = duplex(PIPE_SIZE);
        match fx.registry.try_admit(Connection::new(server), None) {
            Admission::Admitted(_) => clients.push(client),
            Admission::Full(conn) => {
                assert_eq!(fx.registry.len(), 3);
                drop(conn);
            }
        }
        assert!(fx.registry.len() <= 3);

        if round % 4 == 3 {
            let first = fx.registry.slots()[0];
            fx.remove(first);
        }
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emit_races_with_admission_and_removal() {
    let fx = Fixture::new(5);
    let registry = fx.registry.clone();
    let broadcaster = fx.broadcaster.clone();

    let churn = {
        let registry = registry.clone();
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            let mut clients = Vec::new();
            for i in 0..200 {
                let (server, client) = duplex(PIPE_SIZE);
                if let Admission::Admitted(slot) =
                    registry.try_admit(Connection::new(server), None)
                {
                    registry.register_sink(slot, |conn| {
                        broadcaster.subscriber_sink(Arc::clone(conn))
                    });
                    clients.push(client);
                }
                if i % 3 == 0 && !clients.is_empty() {
                    // Disconnect the oldest client and mark a slot failed
                    clients.remove(0);
                    if let Some(slot) = registry.slots().first().copied() {
                        registry.mark_failed(slot);
                    }
                }
                registry.sweep_and_reclaim(|sub| sub.peer_hung_up());
                assert!(registry.len() <= registry.capacity());
                tokio::task::yield_now().await;
            }
            clients
        })
    };

    let emitters: Vec<_> = (0..3)
        .map(|_| {
            let hub = fx.hub.clone();
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    hub.publish(b"racing line\n").await;
                    broadcaster.emit(b"direct line\n").await;
                }
            })
        })
        .collect();

    let _clients = churn.await.unwrap();
    for emitter in emitters {
        emitter.await.unwrap();
    }

    assert!(registry.len() <= registry.capacity());
    registry.drain_all();
    assert_eq!(fx.hub.sink_count(), 0);
}

#[tokio::test]
async fn test_deregistered_slot_is_not_reached_by_hub() {
    let fx = Fixture::new(2);
    let (slot, mut client) = fx.admit();

    // Simulate the source tearing down the registration on its own
    fx.hub.deregister_sink(slot);
    assert_eq!(fx.hub.publish(b"unrouted\n").await, 0);
    assert_eq!(read_available(&mut client).await, b"");
}
