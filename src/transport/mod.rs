//! Transport Module
//!
//! The transport is the network stack the echo core runs on top of. The core
//! only needs a handful of primitives: open a listening endpoint, accept a
//! connection, receive, send, shut down, and close. Everything else (address
//! resolution, retransmission, congestion control) belongs to the transport.
//!
//! ## Implementations
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────────┐
//! │ TcpTransport             │      │ SimTransport                 │
//! │  socket2 setup + Tokio   │      │  in-memory, deterministic    │
//! │  (the production path)   │      │  (tests and benchmarks)      │
//! └──────────────────────────┘      └──────────────────────────────┘
//! ```
//!
//! ## Receive Semantics
//!
//! A receive has three non-error outcomes. `Data(n)` carries bytes,
//! `TimedOut` means the receive timeout elapsed with nothing to read (the
//! caller should simply try again), and `Closed` means the peer finished
//! sending. Errors are reported through `io::Error`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub mod sim;
pub mod tcp;

/// Which side of a connection a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Send,
}

/// Outcome of a successful receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// `n` bytes were written into the caller's buffer (`n > 0`)
    Data(usize),
    /// The receive timeout elapsed without any data arriving
    TimedOut,
    /// The peer closed its sending side; no more data will arrive
    Closed,
}

/// Errors raised while creating a listening endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The transport could not allocate a socket
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    /// Binding to the local address failed
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Entering the listening state failed
    #[error("failed to listen with backlog {backlog}: {source}")]
    Listen {
        backlog: u32,
        #[source]
        source: io::Error,
    },
}

/// A network stack able to open listening endpoints.
pub trait Transport {
    /// The listening endpoint type this transport produces
    type Acceptor: Acceptor;

    /// Creates a stream socket, binds it to `addr` and starts listening with
    /// an accept queue of `backlog` pending connections.
    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<Self::Acceptor, EndpointError>;
}

/// A bound, listening endpoint.
pub trait Acceptor: Send + 'static {
    /// The connection type handed out by `accept`
    type Conn: Connection;

    /// Bounds how long `accept` waits. `None` waits indefinitely.
    fn set_accept_timeout(&mut self, timeout: Option<Duration>);

    /// Waits for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;

    /// The address the endpoint is actually bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// One established, bidirectional byte stream.
///
/// A connection is owned by exactly one task for its whole life; none of the
/// methods need to be safe against concurrent use.
pub trait Connection: Send + 'static {
    /// Bounds how long receive or send calls may block. `None` waits
    /// indefinitely.
    fn set_timeout(&mut self, direction: Direction, timeout: Option<Duration>);

    /// Receives up to `buf.len()` bytes. `buf` must not be empty.
    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<Received>> + Send;

    /// Sends a prefix of `buf`, returning how many bytes the transport
    /// accepted. This may be fewer than `buf.len()`.
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Signals that no more data will be sent or received in either
    /// direction. Calling this more than once, or after the peer already
    /// closed, is not an error.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Releases the connection.
    fn close(self);

    /// The remote address of the connection.
    fn peer_addr(&self) -> SocketAddr;
}
