//! TCP transport backed by Tokio.
//!
//! The listening socket is built with socket2 so the backlog is explicit and
//! each setup step (create, bind, listen) reports its own error. Timeouts are
//! enforced with `tokio::time::timeout` around individual reads and writes.
//!
//! `shutdown` only closes the sending side. The read side stays open so
//! trailing data keeps arriving until the peer's FIN, which is what lets the
//! handler drain instead of resetting the connection.

use super::{Acceptor, Connection, Direction, EndpointError, Received, Transport};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::trace;

/// The production transport: TCP sockets on the host network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Acceptor = TcpAcceptor;

    /// Must be called from within a Tokio runtime, since the resulting
    /// listener is registered with the runtime's reactor.
    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<TcpAcceptor, EndpointError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(EndpointError::Socket)?;

        socket
            .set_reuse_address(true)
            .map_err(EndpointError::Socket)?;
        socket
            .set_nonblocking(true)
            .map_err(EndpointError::Socket)?;

        socket
            .bind(&addr.into())
            .map_err(|source| EndpointError::Bind { addr, source })?;

        let queue = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket
            .listen(queue)
            .map_err(|source| EndpointError::Listen { backlog, source })?;

        let listener =
            TcpListener::from_std(std::net::TcpListener::from(socket)).map_err(EndpointError::Socket)?;

        Ok(TcpAcceptor {
            listener,
            accept_timeout: None,
        })
    }
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    accept_timeout: Option<Duration>,
}

impl Acceptor for TcpAcceptor {
    type Conn = TcpConnection;

    fn set_accept_timeout(&mut self, timeout: Option<Duration>) {
        self.accept_timeout = timeout;
    }

    async fn accept(&mut self) -> io::Result<(TcpConnection, SocketAddr)> {
        let (stream, peer) = match self.accept_timeout {
            None => self.listener.accept().await?,
            Some(limit) => timeout(limit, self.listener.accept())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "accept timed out"))??,
        };

        Ok((TcpConnection::new(stream, peer), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// An established TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    recv_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

impl Connection for TcpConnection {
    fn set_timeout(&mut self, direction: Direction, timeout: Option<Duration>) {
        match direction {
            Direction::Receive => self.recv_timeout = timeout,
            Direction::Send => self.send_timeout = timeout,
        }
    }

    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        let n = match self.recv_timeout {
            None => self.stream.read(buf).await?,
            Some(limit) => match timeout(limit, self.stream.read(buf)).await {
                Ok(read) => read?,
                Err(_) => return Ok(Received::TimedOut),
            },
        };

        if n == 0 {
            return Ok(Received::Closed);
        }
        Ok(Received::Data(n))
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.send_timeout {
            None => self.stream.write(buf).await,
            Some(limit) => timeout(limit, self.stream.write(buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))?,
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        // SHUT_RD would make every later read report end of stream at once
        match SockRef::from(&self.stream).shutdown(Shutdown::Write) {
            // Already torn down by the peer or by an earlier call
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!(peer = %self.peer, "Shutdown on a connection that is already down");
                Ok(())
            }
            other => other,
        }
    }

    fn close(self) {
        drop(self.stream);
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let acceptor = TcpTransport.listen(loopback(), 20).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = TcpTransport.listen(loopback(), 20).unwrap();
        let taken = first.local_addr().unwrap();

        // SO_REUSEADDR does not allow two active listeners on one port
        match TcpTransport.listen(taken, 20) {
            Err(EndpointError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_receive_reports_data_then_closed() {
        let mut acceptor = TcpTransport.listen(loopback(), 20).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = acceptor.accept().await.unwrap();

        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf).await.unwrap(), Received::Data(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(conn.receive(&mut buf).await.unwrap(), Received::Closed);
    }

    #[tokio::test]
    async fn test_receive_timeout_is_not_an_error() {
        let mut acceptor = TcpTransport.listen(loopback(), 20).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = acceptor.accept().await.unwrap();
        conn.set_timeout(Direction::Receive, Some(Duration::from_millis(20)));

        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf).await.unwrap(), Received::TimedOut);
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_harmless() {
        let mut acceptor = TcpTransport.listen(loopback(), 20).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, peer) = acceptor.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), peer);

        tokio_test::assert_ok!(conn.shutdown());
        tokio_test::assert_ok!(conn.shutdown());

        // The client sees an orderly end of stream, not a reset
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        conn.close();
    }

    #[tokio::test]
    async fn test_receive_after_shutdown_waits_for_peer_fin() {
        let mut acceptor = TcpTransport.listen(loopback(), 20).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut conn, _) = acceptor.accept().await.unwrap();
        conn.set_timeout(Direction::Receive, Some(Duration::from_millis(50)));
        conn.shutdown().unwrap();

        // Client is open and silent: the server sees a timeout, not a close
        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf).await.unwrap(), Received::TimedOut);

        // The FIN reached the client while its own sending side still works
        let mut scratch = [0u8; 8];
        assert_eq!(client.read(&mut scratch).await.unwrap(), 0);
        client.write_all(b"late").await.unwrap();
        assert_eq!(conn.receive(&mut buf).await.unwrap(), Received::Data(4));
        assert_eq!(&buf[..4], b"late");

        client.shutdown().await.unwrap();
        assert_eq!(conn.receive(&mut buf).await.unwrap(), Received::Closed);
        conn.close();
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let mut acceptor = TcpTransport.listen(loopback(), 20).unwrap();
        acceptor.set_accept_timeout(Some(Duration::from_millis(20)));

        let err = acceptor.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
