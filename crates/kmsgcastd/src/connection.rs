//! Subscriber connection: serialized writes plus hang-up detection.
//!
//! Every admitted client stream is split in two:
//! - The write half sits behind an async mutex so concurrent broadcasts
//!   never interleave partial writes on the same socket
//! - The read half is owned by a small watcher task that discards inbound
//!   bytes and raises a flag once the peer closes its side
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Write errors are returned as `SendError`, never raised

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::trace;

use crate::broadcast::SendError;

/// Any bidirectional byte stream a subscriber can be served over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type, so TCP streams and
/// in-memory duplex pipes are both accepted.
pub trait SubscriberStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SubscriberStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedStream = Box<dyn SubscriberStream>;

/// Size of the scratch buffer used to drain inbound bytes.
const DISCARD_BUFFER_SIZE: usize = 512;

/// An open connection to one subscriber.
pub struct Connection {
    /// Write half, locked for the whole duration of one line write
    writer: Mutex<WriteHalf<BoxedStream>>,

    /// Set by the watcher once the peer has closed or reset the stream
    hung_up: Arc<AtomicBool>,

    /// Set once the registry has released this connection
    closed: AtomicBool,

    /// Task draining the read half
    watcher: JoinHandle<()>,
}

impl Connection {
    /// Wraps a stream and starts watching it for hang-up.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S: SubscriberStream>(stream: S) -> Self {
        let boxed: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let hung_up = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch_for_hangup(reader, Arc::clone(&hung_up)));

        Self {
            writer: Mutex::new(writer),
            hung_up,
            closed: AtomicBool::new(false),
            watcher,
        }
    }

    /// Writes `line` verbatim and flushes it.
    ///
    /// Waiting for the write lock counts against `write_timeout`, so a
    /// stalled writer on the same connection cannot hold other callers
    /// indefinitely.
    pub async fn write_line(&self, line: &[u8], write_timeout: Duration) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let result = timeout(write_timeout, async {
            let mut writer = self.writer.lock().await;
            // Released while this write was queued behind another
            if self.is_closed() {
                return Err(SendError::Closed);
            }
            writer
                .write_all(line)
                .await
                .map_err(|e| SendError::Io(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| SendError::Io(e.to_string()))
        })
        .await;

        result.unwrap_or(Err(SendError::Timeout(write_timeout)))
    }

    /// Returns true once the peer has closed its side of the stream.
    pub fn peer_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::Acquire)
    }

    /// Returns true once the connection has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases the connection.
    ///
    /// Never blocks: further writes fail with `SendError::Closed`, and the
    /// socket itself is dropped as soon as in-flight writes holding a
    /// reference finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.watcher.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hung_up", &self.peer_hung_up())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drains and discards inbound bytes until EOF or error, then flags hang-up.
async fn watch_for_hangup(mut reader: ReadHalf<BoxedStream>, hung_up: Arc<AtomicBool>) {
    let mut buf = [0u8; DISCARD_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "Discarding inbound bytes from subscriber");
            }
            Err(e) => {
                trace!(error = %e, "Subscriber read side failed");
                break;
            }
        }
    }
    hung_up.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::sleep;

    const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

    async fn wait_for_hangup(conn: &Connection) -> bool {
        for _ in 0..50 {
            if conn.peer_hung_up() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_write_line_is_byte_exact() {
        let (server, mut client) = duplex(1024);
        let conn = Connection::new(server);

        conn.write_line(b"<6>boot ok\n", WRITE_TIMEOUT).await.unwrap();

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<6>boot ok\n");
    }

    #[tokio::test]
    async fn test_peer_drop_is_detected() {
        let (server, client) = duplex(1024);
        let conn = Connection::new(server);
        assert!(!conn.peer_hung_up());

        drop(client);
        assert!(wait_for_hangup(&conn).await);
    }

    #[tokio::test]
    async fn test_inbound_bytes_do_not_count_as_hangup() {
        let (server, mut client) = duplex(1024);
        let conn = Connection::new(server);

        client.write_all(b"ignored input").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!conn.peer_hung_up());
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_fails() {
        let (server, client) = duplex(1024);
        let conn = Connection::new(server);
        drop(client);

        let result = conn.write_line(b"line\n", WRITE_TIMEOUT).await;
        assert!(matches!(result, Err(SendError::Io(_))));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_writes() {
        let (server, _client) = duplex(1024);
        let conn = Connection::new(server);
        conn.close();

        assert!(conn.is_closed());
        let result = conn.write_line(b"line\n", WRITE_TIMEOUT).await;
        assert!(matches!(result, Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        // Tiny pipe that nobody reads from
        let (server, _client) = duplex(8);
        let conn = Connection::new(server);

        let result = conn
            .write_line(&[b'x'; 64], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SendError::Timeout(_))));
    }
}
