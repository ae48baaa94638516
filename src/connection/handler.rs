//! Connection Handler Module
//!
//! This module handles individual client connections to echod.
//! Each client gets its own handler task that echoes everything it receives
//! and then tears the connection down in an orderly way.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned, timeouts set (5 s receive / 5 s send)
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Echo Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Zero buffer, receive    │ │  RECEIVING
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Send until every byte   │ │  SENDING
//!    │  │ received is echoed      │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │ peer closed / receive or send failed
//!        ▼
//! 4. Shutdown (send FIN, keep reading)    SHUTTING_DOWN
//!        │
//!        ▼
//! 5. Drain until peer closes or the      DRAINING
//!    shutdown deadline elapses
//!        │
//!        ▼
//! 6. Close, handler task ends            CLOSED
//! ```
//!
//! ## Buffer Management
//!
//! The transfer buffer is sized to the maximum segment size and owned by the
//! handler. It is zeroed before every receive and reused across cycles. A
//! receive timeout with no data is not a failure: the loop simply waits
//! again.

use crate::transport::{Connection, Direction, Received};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total bytes received from clients
    pub bytes_received: AtomicU64,
    /// Total bytes echoed back to clients
    pub bytes_echoed: AtomicU64,
    /// Send calls that accepted fewer bytes than requested
    pub partial_sends: AtomicU64,
    /// Drain phases that ran until the shutdown deadline
    pub drain_timeouts: AtomicU64,
}

/// A point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub bytes_received: u64,
    pub bytes_echoed: u64,
    pub partial_sends: u64,
    pub drain_timeouts: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, count: usize) {
        self.bytes_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_echoed(&self, count: usize) {
        self.bytes_echoed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn partial_send(&self) {
        self.partial_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drain_timed_out(&self) {
        self.drain_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
            partial_sends: self.partial_sends.load(Ordering::Relaxed),
            drain_timeouts: self.drain_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Transfer buffer capacity (the transport's maximum segment size)
    pub buffer_size: usize,
    /// How long a single receive may block
    pub recv_timeout: Duration,
    /// How long a single send may block
    pub send_timeout: Duration,
    /// How long to drain trailing data after shutdown
    pub shutdown_deadline: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::DEFAULT_MSS,
            recv_timeout: Duration::from_millis(crate::DEFAULT_IO_TIMEOUT_MS),
            send_timeout: Duration::from_millis(crate::DEFAULT_IO_TIMEOUT_MS),
            shutdown_deadline: Duration::from_millis(crate::DEFAULT_SHUTDOWN_DEADLINE_MS),
        }
    }
}

/// Where a handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Receiving,
    Sending,
    ShuttingDown,
    Draining,
    Closed,
}

/// How the drain phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A drain receive reported the peer had closed
    PeerClosed,
    /// The shutdown deadline elapsed first
    DeadlineElapsed,
}

/// What happened over one connection's lifetime.
#[derive(Debug)]
pub struct ConnectionSummary {
    pub peer: SocketAddr,
    pub bytes_received: u64,
    pub bytes_echoed: u64,
    /// Why the echo loop stopped
    pub ended_by: ConnectionError,
    pub drain: DrainOutcome,
}

/// Reasons the echo loop stops.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Client finished sending
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Receiving from the client failed
    #[error("Receive failed: {0}")]
    Receive(#[source] io::Error),

    /// Echoing back to the client failed
    #[error("Send failed: {0}")]
    Send(#[source] io::Error),
}

impl ConnectionError {
    /// True for endings that are part of normal client behaviour.
    pub fn is_graceful(&self) -> bool {
        match self {
            ConnectionError::ClientDisconnected => true,
            ConnectionError::Receive(e) | ConnectionError::Send(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
        }
    }
}

/// Handles a single client connection.
///
/// The handler owns its connection outright; nothing else can touch it
/// while the handler runs.
pub struct ConnectionHandler<C: Connection> {
    /// The connection being served
    conn: C,

    /// Client's address (for logging)
    peer: SocketAddr,

    /// Transfer buffer, sized to the MSS
    buffer: BytesMut,

    config: HandlerConfig,

    state: HandlerState,

    bytes_received: u64,
    bytes_echoed: u64,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<C: Connection> ConnectionHandler<C> {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `conn` - The accepted connection; ownership moves into the handler
    /// * `config` - Buffer size, timeouts and shutdown deadline
    /// * `stats` - Shared connection statistics
    pub fn new(conn: C, config: HandlerConfig, stats: Arc<ConnectionStats>) -> Self {
        stats.connection_opened();

        Self {
            peer: conn.peer_addr(),
            conn,
            buffer: BytesMut::zeroed(config.buffer_size.max(1)),
            config,
            state: HandlerState::Receiving,
            bytes_received: 0,
            bytes_echoed: 0,
            stats,
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Runs the connection to completion: echo, shutdown, drain, close.
    pub async fn run(mut self) -> ConnectionSummary {
        info!(client = %self.peer, "Client connected");

        self.conn
            .set_timeout(Direction::Receive, Some(self.config.recv_timeout));
        self.conn
            .set_timeout(Direction::Send, Some(self.config.send_timeout));

        let ended_by = self.echo_loop().await;
        if ended_by.is_graceful() {
            debug!(client = %self.peer, reason = %ended_by, "Echo loop finished");
        } else {
            warn!(client = %self.peer, error = %ended_by, "Connection error");
        }

        self.shutdown();
        let drain = self.drain().await;
        self.transition(HandlerState::Closed);

        let Self {
            conn,
            peer,
            stats,
            bytes_received,
            bytes_echoed,
            ..
        } = self;

        conn.close();
        stats.connection_closed();

        ConnectionSummary {
            peer,
            bytes_received,
            bytes_echoed,
            ended_by,
            drain,
        }
    }

    /// Receives and echoes until the peer closes or an I/O call fails.
    async fn echo_loop(&mut self) -> ConnectionError {
        loop {
            self.buffer.fill(0);

            let n = match self.conn.receive(&mut self.buffer[..]).await {
                Ok(Received::Data(n)) => n,
                Ok(Received::TimedOut) => {
                    trace!(client = %self.peer, "Receive timed out, waiting again");
                    continue;
                }
                Ok(Received::Closed) => return ConnectionError::ClientDisconnected,
                Err(e) => return ConnectionError::Receive(e),
            };

            self.bytes_received += n as u64;
            self.stats.bytes_received(n);
            trace!(client = %self.peer, bytes = n, "Received data");

            self.transition(HandlerState::Sending);
            if let Err(e) = self.echo(n).await {
                return ConnectionError::Send(e);
            }
            self.transition(HandlerState::Receiving);
        }
    }

    /// Sends the first `len` buffered bytes, retrying partial sends from the
    /// unsent offset.
    async fn echo(&mut self, len: usize) -> io::Result<()> {
        let mut total_sent = 0;

        while total_sent < len {
            let sent = self.conn.send(&self.buffer[total_sent..len]).await?;
            if sent == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport accepted zero bytes",
                ));
            }

            total_sent += sent;
            if total_sent < len {
                self.stats.partial_send();
                trace!(
                    client = %self.peer,
                    sent = total_sent,
                    remaining = len - total_sent,
                    "Partial send"
                );
            }
        }

        self.bytes_echoed += len as u64;
        self.stats.bytes_echoed(len);
        trace!(client = %self.peer, bytes = len, "Echoed data");
        Ok(())
    }

    fn shutdown(&mut self) {
        self.transition(HandlerState::ShuttingDown);
        if let Err(e) = self.conn.shutdown() {
            debug!(client = %self.peer, error = %e, "Shutdown failed");
        }
    }

    /// Discards trailing data until the peer acknowledges closure or the
    /// shutdown deadline elapses.
    async fn drain(&mut self) -> DrainOutcome {
        self.transition(HandlerState::Draining);
        let deadline = Instant::now() + self.config.shutdown_deadline;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, self.conn.receive(&mut self.buffer[..])).await {
                Err(_) => break,
                Ok(Ok(Received::Data(n))) => {
                    trace!(client = %self.peer, bytes = n, "Discarded trailing data");
                }
                Ok(Ok(Received::TimedOut)) => {}
                Ok(Ok(Received::Closed)) | Ok(Err(_)) => return DrainOutcome::PeerClosed,
            }
        }

        self.stats.drain_timed_out();
        debug!(client = %self.peer, "Shutdown deadline elapsed while draining");
        DrainOutcome::DeadlineElapsed
    }

    fn transition(&mut self, next: HandlerState) {
        trace!(client = %self.peer, from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler and runs
/// it to completion. Nothing is reported back to the caller; the outcome is
/// visible only through logs and `stats`.
pub async fn handle_connection<C: Connection>(
    conn: C,
    config: HandlerConfig,
    stats: Arc<ConnectionStats>,
) {
    let summary = ConnectionHandler::new(conn, config, stats).run().await;

    info!(
        client = %summary.peer,
        received = summary.bytes_received,
        echoed = summary.bytes_echoed,
        reason = %summary.ended_by,
        drain = ?summary.drain,
        "Client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::LcgSequence;
    use crate::transport::sim::{Chunking, SimOptions, SimPeer, SimTransport};
    use crate::transport::{Acceptor, Transport};
    use tokio::task::JoinHandle;

    struct Harness {
        peer: SimPeer,
        handler: JoinHandle<ConnectionSummary>,
        stats: Arc<ConnectionStats>,
    }

    async fn start(options: SimOptions, config: HandlerConfig) -> Harness {
        let net = SimTransport::with_options(Arc::new(LcgSequence::new(1)), options);
        let mut acceptor = net.listen("0.0.0.0:0".parse().unwrap(), 4).unwrap();
        let peer = net.connect(acceptor.local_addr().unwrap()).unwrap();
        let (conn, _) = acceptor.accept().await.unwrap();

        let stats = Arc::new(ConnectionStats::new());
        let handler = ConnectionHandler::new(conn, config, Arc::clone(&stats));
        assert_eq!(handler.state(), HandlerState::Receiving);

        Harness {
            peer,
            handler: tokio::spawn(handler.run()),
            stats,
        }
    }

    #[tokio::test]
    async fn test_echo_ping() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        h.peer.write(b"ping").unwrap();
        assert_eq!(h.peer.read_exact(4).await.unwrap(), b"ping");

        h.peer.shutdown_write();
        let summary = h.handler.await.unwrap();

        assert!(matches!(summary.ended_by, ConnectionError::ClientDisconnected));
        assert_eq!(summary.drain, DrainOutcome::PeerClosed);
        assert_eq!(summary.bytes_echoed, 4);
        assert!(h.peer.is_closed());
    }

    #[tokio::test]
    async fn test_multi_segment_payload_preserves_order() {
        let options = SimOptions {
            mss: 64,
            chunking: Chunking::Whole,
        };
        let config = HandlerConfig {
            buffer_size: 64,
            ..HandlerConfig::default()
        };
        let mut h = start(options, config).await;

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        h.peer.write(&payload).unwrap();
        h.peer.shutdown_write();

        assert_eq!(h.peer.read_to_end().await.unwrap(), payload);
        let summary = h.handler.await.unwrap();
        assert_eq!(summary.bytes_received, 1000);
        assert_eq!(summary.bytes_echoed, 1000);
    }

    #[tokio::test]
    async fn test_partial_sends_are_retried() {
        let options = SimOptions {
            mss: 1460,
            chunking: Chunking::Random { max: 7, seed: 3 },
        };
        let mut h = start(options, HandlerConfig::default()).await;

        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        h.peer.write(&payload).unwrap();
        assert_eq!(h.peer.read_exact(payload.len()).await.unwrap(), payload);

        // 43 bytes in chunks of at most 7 needs at least 7 sends
        assert!(h.peer.send_calls() >= 7);
        assert!(h.stats.snapshot().partial_sends >= 6);

        h.peer.shutdown_write();
        h.handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_chunks_deliver_full_count() {
        let options = SimOptions {
            mss: 1460,
            chunking: Chunking::Fixed(3),
        };
        let mut h = start(options, HandlerConfig::default()).await;

        h.peer.write(b"0123456789").unwrap();
        assert_eq!(h.peer.read_exact(10).await.unwrap(), b"0123456789");
        assert_eq!(h.peer.send_calls(), 4);

        h.peer.shutdown_write();
        h.handler.await.unwrap();
        assert_eq!(h.stats.snapshot().bytes_echoed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_receive_timeouts_keep_connection_open() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        // Three receive timeouts pass without data
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!h.peer.is_closed());

        h.peer.write(b"still here").unwrap();
        assert_eq!(h.peer.read_exact(10).await.unwrap(), b"still here");

        h.peer.shutdown_write();
        h.handler.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_at_deadline_when_peer_never_closes() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        h.peer.write(b"hi").unwrap();
        assert_eq!(h.peer.read_exact(2).await.unwrap(), b"hi");

        // Peer stops reading but keeps its sending side open
        h.peer.stop_reading();
        h.peer.write(b"trailing").unwrap();

        let started = Instant::now();
        let summary = h.handler.await.unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(summary.ended_by, ConnectionError::Send(_)));
        assert_eq!(summary.drain, DrainOutcome::DeadlineElapsed);
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed < Duration::from_millis(5100));
        assert_eq!(h.stats.snapshot().drain_timeouts, 1);
        assert!(h.peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_ends_early_when_peer_closes() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        h.peer.stop_reading();
        h.peer.write(b"x").unwrap();

        // Handler is now draining; peer closes after one second
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = Instant::now();
        h.peer.shutdown_write();

        let summary = h.handler.await.unwrap();
        assert_eq!(summary.drain, DrainOutcome::PeerClosed);
        assert!(started.elapsed() < Duration::from_secs(4));
        h.peer.wait_closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_hits_send_timeout() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        h.peer.stall();
        h.peer.write(b"blocked").unwrap();
        h.peer.shutdown_write();

        let started = Instant::now();
        let summary = h.handler.await.unwrap();

        match summary.ended_by {
            ConnectionError::Send(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected send timeout, got {other}"),
        }
        // Send timeout, then the drain sees the peer's close at once
        assert_eq!(summary.drain, DrainOutcome::PeerClosed);
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert!(started.elapsed() < Duration::from_millis(5100));
    }

    #[tokio::test]
    async fn test_shutdown_invoked_once_per_connection() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        h.peer.shutdown_write();
        h.handler.await.unwrap();
        assert_eq!(h.peer.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let mut h = start(SimOptions::default(), HandlerConfig::default()).await;

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.connections_accepted, 1);
        assert_eq!(snapshot.active_connections, 1);

        h.peer.write(b"abc").unwrap();
        h.peer.read_exact(3).await.unwrap();
        h.peer.shutdown_write();
        let summary = h.handler.await.unwrap();
        assert_eq!(summary.bytes_received, 3);
        assert_eq!(summary.bytes_echoed, 3);

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.bytes_received, 3);
        assert_eq!(snapshot.bytes_echoed, 3);
    }

    #[tokio::test]
    async fn test_handle_connection_reports_through_stats() {
        let net = SimTransport::new(Arc::new(LcgSequence::new(3)));
        let mut acceptor = net.listen("0.0.0.0:0".parse().unwrap(), 4).unwrap();
        let mut peer = net.connect(acceptor.local_addr().unwrap()).unwrap();
        let (conn, client) = acceptor.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), client);

        let stats = Arc::new(ConnectionStats::new());
        let task = tokio::spawn(handle_connection(
            conn,
            HandlerConfig::default(),
            Arc::clone(&stats),
        ));

        peer.write(b"hello").unwrap();
        assert_eq!(peer.read_exact(5).await.unwrap(), b"hello");
        peer.shutdown_write();
        task.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.bytes_echoed, 5);
        assert!(peer.is_closed());
    }
}
