//! In-memory simulated transport.
//!
//! `SimTransport` stands in for a network stack in tests and benchmarks. A
//! test plays the remote side through a [`SimPeer`] while the server side gets
//! an ordinary [`Connection`] from the acceptor.
//!
//! ## What Is Modelled
//!
//! - Peer writes are cut into segments no larger than the MSS
//! - Sends are accepted in configurable chunks (see [`Chunking`]), so the
//!   caller has to handle partial sends
//! - The accept queue is bounded by the listen backlog; connecting to a full
//!   queue is refused
//! - Closing handshake: after a local shutdown, receive keeps returning
//!   trailing data (or timing out) until the peer closes its sending side
//! - Each connection draws initial sequence numbers from the injected
//!   [`SequenceSource`] and advances them as bytes move
//!
//! ```text
//!   SimPeer                                  SimConnection
//!  ┌─────────┐  write() ── MSS segments ──> ┌──────────────┐
//!  │         │                              │  receive()   │
//!  │         │ <── chunks ── send() ─────── │  send()      │
//!  └─────────┘                              └──────────────┘
//! ```

use super::{Acceptor, Connection, Direction, EndpointError, Received, Transport};
use crate::sequence::SequenceSource;
use bytes::{Buf, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// First port handed out when listening on port 0
const EPHEMERAL_PORT_START: u16 = 49152;

/// How a simulated connection accepts outgoing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunking {
    /// Every send accepts the whole buffer
    Whole,
    /// Every send accepts at most this many bytes
    Fixed(usize),
    /// Every send accepts a random length in `1..=max`, from a seeded RNG
    Random { max: usize, seed: u64 },
}

impl Chunking {
    fn rng(&self, connection_index: u64) -> Option<StdRng> {
        match *self {
            Chunking::Random { seed, .. } => {
                Some(StdRng::seed_from_u64(seed ^ connection_index))
            }
            _ => None,
        }
    }
}

/// Options for a simulated network.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Largest segment a single receive can return
    pub mss: usize,
    /// How sends are split
    pub chunking: Chunking,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            mss: crate::DEFAULT_MSS,
            chunking: Chunking::Whole,
        }
    }
}

type Pending = (SimConnection, SocketAddr);

#[derive(Default)]
struct Network {
    listeners: HashMap<SocketAddr, mpsc::Sender<Pending>>,
    next_port: u16,
    next_peer: u32,
    connections: u64,
}

/// A simulated network stack.
///
/// Cloning is cheap; clones share the same set of listeners.
#[derive(Clone)]
pub struct SimTransport {
    network: Arc<Mutex<Network>>,
    sequence: Arc<dyn SequenceSource>,
    options: SimOptions,
    exhausted: Arc<AtomicBool>,
}

impl SimTransport {
    pub fn new(sequence: Arc<dyn SequenceSource>) -> Self {
        Self::with_options(sequence, SimOptions::default())
    }

    pub fn with_options(sequence: Arc<dyn SequenceSource>, options: SimOptions) -> Self {
        Self {
            network: Arc::new(Mutex::new(Network {
                next_port: EPHEMERAL_PORT_START,
                ..Network::default()
            })),
            sequence,
            options,
            exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// When set, creating a listening socket fails as if the stack had run
    /// out of sockets.
    pub fn set_socket_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Relaxed);
    }

    /// Tears down every listener. Pending and future accepts fail.
    pub fn shutdown_network(&self) {
        self.lock().listeners.clear();
    }

    /// Opens a connection to a listening address.
    ///
    /// Fails with `ConnectionRefused` if nothing listens there or the accept
    /// queue is full.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<SimPeer> {
        let mut network = self.lock();

        let open = network
            .listeners
            .get(&addr)
            .filter(|queue| !queue.is_closed())
            .cloned();
        let Some(queue) = open else {
            network.listeners.remove(&addr);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {addr}"),
            ));
        };

        network.next_peer = network.next_peer.wrapping_add(1);
        let peer_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::from(0x0a00_0000 | (network.next_peer & 0x00ff_ffff))),
            40000 + (network.next_peer % 20000) as u16,
        );
        let index = network.connections;
        network.connections += 1;
        drop(network);

        let (conn, peer) = self.pair(addr, peer_addr, index);

        queue.try_send((conn, peer_addr)).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("accept queue on {addr} is full"),
            )
        })?;

        Ok(peer)
    }

    fn pair(&self, local: SocketAddr, remote: SocketAddr, index: u64) -> (SimConnection, SimPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let server_isn = self.sequence.initial_sequence_number(local, remote);
        let client_isn = self.sequence.initial_sequence_number(remote, local);

        let shared = Arc::new(Shared {
            shutdown_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            closed: closed_tx,
            server_isn,
            client_isn,
            snd_nxt: AtomicU32::new(server_isn.wrapping_add(1)),
            rcv_nxt: AtomicU32::new(client_isn.wrapping_add(1)),
        });

        let conn = SimConnection {
            peer: remote,
            inbound: inbound_rx,
            pending: BytesMut::new(),
            outbound: Some(outbound_tx),
            chunking: self.options.chunking,
            rng: self.options.chunking.rng(index),
            recv_timeout: None,
            send_timeout: None,
            shut_down: false,
            shared: Arc::clone(&shared),
        };

        let peer = SimPeer {
            mss: self.options.mss.max(1),
            inbound: Some(inbound_tx),
            outbound: Some(outbound_rx),
            inbox: BytesMut::new(),
            closed: closed_rx,
            shared,
        };

        (conn, peer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SimTransport {
    type Acceptor = SimAcceptor;

    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<SimAcceptor, EndpointError> {
        if self.exhausted.load(Ordering::Relaxed) {
            return Err(EndpointError::Socket(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "no free sockets",
            )));
        }

        let mut network = self.lock();
        // Forget listeners whose acceptor has been dropped
        network.listeners.retain(|_, queue| !queue.is_closed());

        let mut local = addr;
        if local.port() == 0 {
            local.set_port(network.next_port);
            network.next_port = network.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
        }

        if matches!(network.listeners.get(&local), Some(queue) if !queue.is_closed()) {
            return Err(EndpointError::Bind {
                addr: local,
                source: io::Error::new(io::ErrorKind::AddrInUse, "address already in use"),
            });
        }

        if backlog == 0 {
            return Err(EndpointError::Listen {
                backlog,
                source: io::Error::new(io::ErrorKind::InvalidInput, "backlog must be positive"),
            });
        }

        let (tx, rx) = mpsc::channel(backlog as usize);
        network.listeners.insert(local, tx);

        Ok(SimAcceptor {
            local,
            queue: rx,
            accept_timeout: None,
        })
    }
}

/// A simulated listening endpoint.
pub struct SimAcceptor {
    local: SocketAddr,
    queue: mpsc::Receiver<Pending>,
    accept_timeout: Option<Duration>,
}

impl Acceptor for SimAcceptor {
    type Conn = SimConnection;

    fn set_accept_timeout(&mut self, timeout: Option<Duration>) {
        self.accept_timeout = timeout;
    }

    async fn accept(&mut self) -> io::Result<(SimConnection, SocketAddr)> {
        let next = match self.accept_timeout {
            None => self.queue.recv().await,
            Some(limit) => timeout(limit, self.queue.recv())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "accept timed out"))?,
        };

        next.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "network is down"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// State visible to both ends of a simulated connection.
struct Shared {
    shutdown_calls: AtomicUsize,
    send_calls: AtomicUsize,
    stalled: AtomicBool,
    closed: watch::Sender<bool>,
    server_isn: u32,
    client_isn: u32,
    /// Next sequence number the server side will send
    snd_nxt: AtomicU32,
    /// Next sequence number the server side expects from the peer
    rcv_nxt: AtomicU32,
}

/// Server side of a simulated connection.
pub struct SimConnection {
    peer: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    chunking: Chunking,
    rng: Option<StdRng>,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    shut_down: bool,
    shared: Arc<Shared>,
}

impl SimConnection {
    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.shared.rcv_nxt.fetch_add(n as u32, Ordering::Relaxed);
        n
    }

    fn chunk_len(&mut self, len: usize) -> usize {
        match (self.chunking, self.rng.as_mut()) {
            (Chunking::Whole, _) => len,
            (Chunking::Fixed(max), _) => len.min(max.max(1)),
            (Chunking::Random { max, .. }, Some(rng)) => rng.gen_range(1..=len.min(max.max(1))),
            (Chunking::Random { .. }, None) => len,
        }
    }
}

impl Connection for SimConnection {
    fn set_timeout(&mut self, direction: Direction, timeout: Option<Duration>) {
        match direction {
            Direction::Receive => self.recv_timeout = timeout,
            Direction::Send => self.send_timeout = timeout,
        }
    }

    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        if !self.pending.is_empty() {
            return Ok(Received::Data(self.take_pending(buf)));
        }

        let segment = match self.recv_timeout {
            None => self.inbound.recv().await,
            Some(limit) => match timeout(limit, self.inbound.recv()).await {
                Ok(segment) => segment,
                Err(_) => return Ok(Received::TimedOut),
            },
        };

        match segment {
            Some(segment) => {
                self.pending.extend_from_slice(&segment);
                Ok(Received::Data(self.take_pending(buf)))
            }
            None => Ok(Received::Closed),
        }
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shut_down {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection is shut down"));
        }

        if self.shared.stalled.load(Ordering::Relaxed) {
            match self.send_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"));
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let n = self.chunk_len(buf.len());
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "connection is shut down"))?;
        outbound
            .send(Bytes::copy_from_slice(&buf[..n]))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer stopped reading"))?;

        self.shared.send_calls.fetch_add(1, Ordering::Relaxed);
        self.shared.snd_nxt.fetch_add(n as u32, Ordering::Relaxed);
        Ok(n)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.shared.shutdown_calls.fetch_add(1, Ordering::Relaxed);
        self.shut_down = true;
        // FIN: the peer sees end of stream once it has read what was sent
        self.outbound = None;
        Ok(())
    }

    fn close(self) {
        self.shared.closed.send_replace(true);
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.shared.closed.send_replace(true);
    }
}

/// Remote side of a simulated connection, driven by tests.
pub struct SimPeer {
    mss: usize,
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    outbound: Option<mpsc::UnboundedReceiver<Bytes>>,
    inbox: BytesMut,
    closed: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl SimPeer {
    /// Sends `data` to the server, cut into MSS-sized segments.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "write side is shut down"))?;

        for segment in data.chunks(self.mss) {
            inbound
                .send(Bytes::copy_from_slice(segment))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server is gone"))?;
        }
        Ok(())
    }

    /// Half-closes: the server will see end of stream after buffered data.
    pub fn shutdown_write(&mut self) {
        self.inbound = None;
    }

    /// Stops reading; further server sends fail.
    pub fn stop_reading(&mut self) {
        self.outbound = None;
    }

    /// Makes server sends block until their send timeout elapses.
    pub fn stall(&self) {
        self.shared.stalled.store(true, Ordering::Relaxed);
    }

    /// Reads exactly `len` echoed bytes.
    pub async fn read_exact(&mut self, len: usize) -> io::Result<Vec<u8>> {
        while self.inbox.len() < len {
            let outbound = self
                .outbound
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer stopped reading"))?;

            match outbound.recv().await {
                Some(chunk) => self.inbox.extend_from_slice(&chunk),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection ended before enough bytes arrived",
                    ))
                }
            }
        }
        Ok(self.inbox.split_to(len).to_vec())
    }

    /// Reads everything until the server shuts down or closes.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let outbound = self
            .outbound
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer stopped reading"))?;

        while let Some(chunk) = outbound.recv().await {
            self.inbox.extend_from_slice(&chunk);
        }
        Ok(self.inbox.split().to_vec())
    }

    /// Waits until the server side has released the connection.
    pub async fn wait_closed(&mut self) {
        // An Err means the sender is gone, which also implies closed
        let _ = self.closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// How many times the server side called shutdown.
    pub fn shutdown_calls(&self) -> usize {
        self.shared.shutdown_calls.load(Ordering::Relaxed)
    }

    /// How many successful send calls the server side made.
    pub fn send_calls(&self) -> usize {
        self.shared.send_calls.load(Ordering::Relaxed)
    }

    /// Initial sequence number chosen for the server side.
    pub fn server_isn(&self) -> u32 {
        self.shared.server_isn
    }

    /// Initial sequence number chosen for this peer.
    pub fn client_isn(&self) -> u32 {
        self.shared.client_isn
    }

    /// Next sequence number the server side will send.
    pub fn server_next_sequence(&self) -> u32 {
        self.shared.snd_nxt.load(Ordering::Relaxed)
    }

    /// Next sequence number the server side expects to receive.
    pub fn server_next_expected(&self) -> u32 {
        self.shared.rcv_nxt.load(Ordering::Relaxed)
    }
}
