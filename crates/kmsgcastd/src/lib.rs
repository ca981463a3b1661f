//! kmsgcast daemon - subscriber registry and broadcast server
//!
//! This crate provides the core infrastructure for streaming a log feed
//! (normally the kernel log) to remote TCP clients:
//! - `registry` - Bounded, slot-indexed registry of connected subscribers
//! - `broadcast` - Fan-out of log lines to every active subscriber
//! - `connection` - Per-subscriber stream with serialized writes and hang-up detection
//! - `server` - Lifecycle loop: sweep, accept, admit, drain
//! - `source` - Log source boundary (`LogSource`, `LineSink`) and the in-process `LogHub`
//! - `config` - Daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     kmsgcastd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐          ┌─────────────────────────┐   │
//! │  │  Server loop    │─admit───▶│        Registry         │   │
//! │  │ (TcpAcceptor)   │─sweep───▶│ (slot -> Subscriber)    │   │
//! │  └─────────────────┘          └────────────▲────────────┘   │
//! │                                            │ snapshot       │
//! │  ┌─────────────────┐          ┌────────────┴────────────┐   │
//! │  │     LogHub      │─emit────▶│      Broadcaster        │   │
//! │  │ (line source)   │          │ (per-subscriber writes) │   │
//! │  └─────────────────┘          └─────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows a panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Per-connection failures are logged and never abort the service

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod source;

pub use broadcast::{Broadcaster, SendError};
pub use config::{ConfigError, ServerConfig, SourceFormat};
pub use connection::Connection;
pub use registry::{Admission, Registry, SlotIndex, Subscriber, SubscriberState};
pub use server::{Listener, Server, ServerError, ServerHandle, ShutdownReport, TcpAcceptor};
pub use source::{LineSender, LineSink, LogHub, LogSource};
