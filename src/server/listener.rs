//! TCP listener and accept loop.
//!
//! # Responsibilities
//! - Create the listening endpoint (socket, bind, listen with backlog)
//! - Accept incoming connections, waiting indefinitely
//! - Hand each connection to a freshly spawned handler task
//! - Treat transport failures that make accepting impossible as fatal

use crate::connection::{handle_connection, ConnectionStats, HandlerConfig};
use crate::runtime::TaskRuntime;
use crate::transport::{Acceptor, EndpointError, Transport};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Error type for listener operations. Every variant is fatal.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listening endpoint could not be created.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// Accepting failed in a way that leaves the transport unusable.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Local address to bind (host and port)
    pub addr: SocketAddr,
    /// Accept queue depth
    pub backlog: u32,
    /// Stop after this many accepted connections; `None` runs forever
    pub accept_limit: Option<usize>,
    /// Settings handed to every connection handler
    pub handler: HandlerConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(
                crate::DEFAULT_HOST
                    .parse()
                    .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
                crate::DEFAULT_PORT,
            ),
            backlog: crate::DEFAULT_BACKLOG,
            accept_limit: None,
            handler: HandlerConfig::default(),
        }
    }
}

/// Accepts connections and dispatches each to its own handler task.
pub struct Listener<A: Acceptor, R: TaskRuntime> {
    acceptor: A,
    runtime: R,
    config: ListenerConfig,
    stats: Arc<ConnectionStats>,
    local_addr: SocketAddr,
}

impl<A: Acceptor, R: TaskRuntime> Listener<A, R> {
    /// Creates the listening endpoint.
    ///
    /// Failure here is unrecoverable: without a listening socket there is
    /// nothing for the server to do.
    pub fn start<T>(
        transport: &T,
        config: ListenerConfig,
        runtime: R,
        stats: Arc<ConnectionStats>,
    ) -> Result<Self, ListenerError>
    where
        T: Transport<Acceptor = A>,
    {
        let mut acceptor = transport.listen(config.addr, config.backlog)?;
        acceptor.set_accept_timeout(None);

        let local_addr = acceptor
            .local_addr()
            .map_err(|e| ListenerError::Endpoint(EndpointError::Socket(e)))?;

        info!(
            address = %local_addr,
            backlog = config.backlog,
            "Listener bound"
        );

        Ok(Self {
            acceptor,
            runtime,
            config,
            stats,
            local_addr,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop.
    ///
    /// Returns `Ok(())` only when an accept limit is configured and reached,
    /// and then only after every handler this listener spawned has finished.
    /// Otherwise the loop runs until a fatal accept error.
    pub async fn run(mut self) -> Result<(), ListenerError> {
        let mut accepted = 0usize;

        // Each handler task holds a sender; recv() yields None once all are gone
        let (handler_tx, mut handlers_done) = mpsc::channel::<()>(1);

        loop {
            if let Some(limit) = self.config.accept_limit {
                if accepted >= limit {
                    info!(accepted, "Accept limit reached, waiting for handlers to finish");
                    drop(self.acceptor);
                    drop(handler_tx);
                    let _ = handlers_done.recv().await;
                    info!("Listener stopped");
                    return Ok(());
                }
            }

            match self.acceptor.accept().await {
                Ok((conn, peer)) => {
                    accepted += 1;
                    debug!(peer = %peer, accepted, "Connection accepted");

                    let config = self.config.handler.clone();
                    let stats = Arc::clone(&self.stats);
                    let in_flight = handler_tx.clone();

                    // The connection moves into the task; the listener keeps nothing
                    self.runtime.spawn("echo-connection", async move {
                        handle_connection(conn, config, stats).await;
                        drop(in_flight);
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Transient accept failure");
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, transport is unusable");
                    return Err(ListenerError::Accept(e));
                }
            }
        }
    }
}

/// Accept errors caused by a single peer rather than the transport itself.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    )
}
