//! Connection Handler Module
//!
//! This module manages individual client connections to echod.
//! Each client connection is handled by its own async task, so a slow or
//! misbehaving peer never holds up the listener or any other client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Listener                                │
//! │                  (server module)                            │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           └────────────┬───────────┘
//!                        │
//!                        │ spawn task (connection moves in)
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  Receive    │───>│  Echo all   │───>│  Receive... │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │         │ closed / error                                    │
//! │         ▼                                                   │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  Shutdown   │───>│   Drain     │───>│   Close     │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Partial-send retry**: every received byte is echoed before the next
//!   receive
//! - **Bounded teardown**: draining after shutdown stops at a deadline
//! - **Statistics**: Tracks connection and byte counters
//!
//! ## Example
//!
//! ```ignore
//! use echod::connection::{handle_connection, ConnectionStats, HandlerConfig};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(ConnectionStats::new());
//!
//! // For each accepted connection...
//! let (conn, _addr) = acceptor.accept().await?;
//! tokio::spawn(handle_connection(conn, HandlerConfig::default(), stats));
//! ```

pub mod handler;

// Re-export commonly used types
pub use handler::{
    handle_connection, ConnectionError, ConnectionHandler, ConnectionStats, ConnectionSummary,
    DrainOutcome, HandlerConfig, HandlerState, StatsSnapshot,
};
