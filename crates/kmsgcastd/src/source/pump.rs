//! Line pump: hands lines from producers to the `LogHub` in order.
//!
//! Producers that must not block (signal-ish contexts, foreign threads,
//! readers that outpace the network) push lines into a bounded channel
//! through a cloneable `LineSender`. A single pump task drains the channel
//! and publishes each line, which also serializes emission order.

use std::io::ErrorKind;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::kmsg::format_kmsg_record;
use super::LogHub;
use crate::config::SourceFormat;

/// Default number of lines buffered between producers and the pump.
pub const DEFAULT_PUMP_CAPACITY: usize = 1024;

/// Counters reported when a pump stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Lines handed on
    pub lines: u64,
    /// Lines dropped (dictionary lines, or a full/closed channel)
    pub dropped: u64,
}

/// Cloneable handle for feeding lines into the pump.
#[derive(Debug, Clone)]
pub struct LineSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl LineSender {
    /// Queues a line, waiting for buffer space.
    ///
    /// Returns false if the pump has stopped.
    pub async fn send(&self, line: impl Into<Vec<u8>>) -> bool {
        self.tx.send(line.into()).await.is_ok()
    }

    /// Queues a line without waiting. The line is dropped if the buffer is
    /// full or the pump has stopped; returns whether it was queued.
    pub fn try_send(&self, line: impl Into<Vec<u8>>) -> bool {
        self.tx.try_send(line.into()).is_ok()
    }

    /// Queues a line from a synchronous thread, blocking for buffer space.
    ///
    /// Must not be called from inside an async context.
    pub fn blocking_send(&self, line: impl Into<Vec<u8>>) -> bool {
        self.tx.blocking_send(line.into()).is_ok()
    }

    /// Returns true once the pump has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns the pump task publishing into `hub`.
///
/// The task stops when `cancel_token` fires or every `LineSender` has been
/// dropped, and reports how many lines it published.
pub fn spawn_pump(
    hub: Arc<LogHub>,
    capacity: usize,
    cancel_token: CancellationToken,
) -> (LineSender, JoinHandle<PumpStats>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut stats = PumpStats::default();
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Line pump shutting down");
                    break;
                }

                line = rx.recv() => {
                    match line {
                        Some(line) => {
                            hub.publish(&line).await;
                            stats.lines += 1;
                        }
                        None => {
                            debug!("All line senders dropped");
                            break;
                        }
                    }
                }
            }
        }
        stats
    });

    (LineSender { tx }, handle)
}

/// Reads newline-terminated records from `reader` and queues them on
/// `sender` until EOF, cancellation, or a stopped pump.
///
/// With `SourceFormat::Kmsg` each record is rendered in console form and
/// dictionary lines are skipped. A `BrokenPipe` read error means the kernel
/// ring buffer overwrote records we had not read yet; it is logged and
/// reading continues. Any other read error is returned.
pub async fn pump_reader<R>(
    reader: R,
    format: SourceFormat,
    sender: LineSender,
    cancel_token: CancellationToken,
) -> std::io::Result<PumpStats>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut stats = PumpStats::default();

    loop {
        buf.clear();

        let read = tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Source reader cancelled");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!(lines = stats.lines, "Log source reached end of input");
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                warn!("Kernel log records were overwritten before they could be read");
                continue;
            }
            Err(e) => return Err(e),
        }

        let line = match format {
            SourceFormat::Raw => Some(buf.clone()),
            SourceFormat::Kmsg => format_kmsg_record(&buf),
        };

        let Some(line) = line else {
            stats.dropped += 1;
            continue;
        };

        if !sender.send(line).await {
            debug!("Line pump stopped, ending source reader");
            break;
        }
        stats.lines += 1;
    }

    Ok(stats)
}
