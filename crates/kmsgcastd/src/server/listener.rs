//! Listener boundary and the TCP implementation.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use tokio::net::TcpSocket;
use tracing::{debug, info};

use super::ServerError;
use crate::connection::SubscriberStream;

/// Source of incoming connections for the lifecycle loop.
///
/// Accepting is split from async setup so that a connection rejected at
/// capacity can be closed without ever entering the async runtime.
pub trait Listener: Send + 'static {
    /// Freshly accepted connection
    type Stream: Send + 'static;

    /// Connection ready to be served
    type Async: SubscriberStream;

    /// Accepts the next pending connection. `Ok(None)` means none is
    /// waiting right now.
    fn accept_nonblocking(&mut self) -> io::Result<Option<Self::Stream>>;

    /// Remote address of an accepted connection.
    fn peer_address(&self, stream: &Self::Stream) -> io::Result<SocketAddr>;

    /// Prepares an accepted connection for async I/O.
    fn into_async(&self, stream: Self::Stream) -> io::Result<Self::Async>;

    /// Releases the listening resource. Later accepts fail.
    fn close(&mut self);
}

/// Non-blocking TCP listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: Option<std::net::TcpListener>,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Binds `addr` with `SO_REUSEADDR` and the given listen backlog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, ServerError> {
        let bind_err = |e: io::Error| ServerError::Bind {
            addr,
            error: e.to_string(),
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;

        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;

        let listener = socket
            .listen(backlog.max(1))
            .and_then(|l| l.into_std())
            .map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(addr = %local_addr, backlog, "Listening for subscribers");

        Ok(Self {
            listener: Some(listener),
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }
}

impl Listener for TcpAcceptor {
    type Stream = std::net::TcpStream;
    type Async = tokio::net::TcpStream;

    fn accept_nonblocking(&mut self) -> io::Result<Option<Self::Stream>> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(io::Error::new(ErrorKind::NotConnected, "listener closed"));
        };

        match listener.accept() {
            Ok((stream, _addr)) => Ok(Some(stream)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn peer_address(&self, stream: &Self::Stream) -> io::Result<SocketAddr> {
        stream.peer_addr()
    }

    fn into_async(&self, stream: Self::Stream) -> io::Result<Self::Async> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        tokio::net::TcpStream::from_std(stream)
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(addr = %self.local_addr, "Listener closed");
        }
    }
}
