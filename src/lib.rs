//! # echod - A TCP Byte-Echo Server
//!
//! echod accepts inbound stream connections, returns to each peer exactly the
//! bytes it sent, and tears every connection down in an orderly, bounded way
//! once either side stops sending.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                echod                                    │
//! │                                                                         │
//! │  ┌─────────────┐  spawn   ┌───────────────────┐                         │
//! │  │  Listener   │─────────>│ ConnectionHandler │  (one task per peer)    │
//! │  │ accept loop │          │  echo → shutdown  │                         │
//! │  └──────┬──────┘          │  → drain → close  │                         │
//! │         │                 └─────────┬─────────┘                         │
//! │         │                           │                                   │
//! │         ▼                           ▼                                   │
//! │  ┌──────────────────────────────────────────────┐   ┌────────────────┐  │
//! │  │                  Transport                   │   │  TaskRuntime   │  │
//! │  │  ┌────────────────┐   ┌───────────────────┐  │   │ (Tokio tasks)  │  │
//! │  │  │ TcpTransport   │   │ SimTransport      │  │   └────────────────┘  │
//! │  │  │ (socket2+tokio)│   │ (in-memory, tests)│  │                       │
//! │  │  └────────────────┘   └───────────────────┘  │   ┌────────────────┐  │
//! │  └──────────────────────────────────────────────┘   │ SequenceSource │  │
//! │                                                     └────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use echod::server::{Listener, ListenerConfig};
//! use echod::transport::tcp::TcpTransport;
//! use echod::runtime::TokioRuntime;
//! use echod::connection::ConnectionStats;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = Listener::start(
//!         &TcpTransport,
//!         ListenerConfig::default(),
//!         TokioRuntime,
//!         stats,
//!     )?;
//!     listener.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`server`]: Listening endpoint and accept loop
//! - [`connection`]: Per-connection echo and teardown lifecycle
//! - [`transport`]: Transport seam, with TCP and simulated implementations
//! - [`runtime`]: Task runtime seam used to spawn handlers
//! - [`sequence`]: Injected source of unpredictable sequence numbers
//! - [`config`]: CLI and TOML configuration
//!
//! ## Connection Lifecycle
//!
//! Every handler follows the same state machine:
//!
//! ```text
//! RECEIVING ──data──> SENDING ──echoed──> RECEIVING
//!     │                  │
//!     └──closed/error────┴──> SHUTTING_DOWN ──> DRAINING ──> CLOSED
//! ```
//!
//! Draining is bounded by a shutdown deadline (5 s by default), so a peer that
//! never acknowledges closure cannot pin a handler forever.

pub mod config;
pub mod connection;
pub mod runtime;
pub mod sequence;
pub mod server;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError};
pub use connection::{ConnectionError, ConnectionHandler, ConnectionStats, HandlerConfig};
pub use runtime::{TaskRuntime, TokioRuntime};
pub use sequence::{LcgSequence, RandomSequence, SequenceSource};
pub use server::{Listener, ListenerConfig, ListenerError};

/// The default port echod listens on
pub const DEFAULT_PORT: u16 = 10000;

/// The default host echod binds to (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default accept queue depth
pub const DEFAULT_BACKLOG: u32 = 20;

/// Default transfer buffer size: a typical Ethernet TCP maximum segment size
pub const DEFAULT_MSS: usize = 1460;

/// Default receive and send timeout, in milliseconds
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 5000;

/// Default window for draining trailing data after teardown, in milliseconds
pub const DEFAULT_SHUTDOWN_DEADLINE_MS: u64 = 5000;

/// Version of echod
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
