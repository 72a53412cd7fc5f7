//! Outbound TCP stream

use super::TunnelError;
use crate::protocol::StreamId;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Connect issued, waiting for completion
    Connecting,
    /// Connected and readable
    Open,
    /// Failed or closed; never reopened
    Closed,
}

/// Socket in its current phase
enum Socket {
    Allocated(TcpSocket),
    Connecting(ConnectFuture),
    Connected(TcpStream),
    Released,
}

/// Result of a single read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes read from the peer
    Data(Bytes),
    /// Orderly close by the peer
    Eof,
    /// Readiness was spurious; nothing to read yet
    WouldBlock,
}

/// One tunneled outbound TCP connection
pub struct TunnelStream {
    /// Stream ID
    id: StreamId,
    /// Current state
    state: StreamState,
    /// Owned socket
    socket: Socket,
}

impl TunnelStream {
    /// Allocate a socket of the address family of `addr`
    pub fn create(id: StreamId, addr: &SocketAddr) -> Result<Self, TunnelError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        Ok(Self {
            id,
            state: StreamState::Connecting,
            socket: Socket::Allocated(socket),
        })
    }

    /// Issue a non-blocking connect. Completion is observed through
    /// [`TunnelStream::poll_connect`].
    pub fn begin_connect(&mut self, addr: SocketAddr) -> Result<(), TunnelError> {
        match std::mem::replace(&mut self.socket, Socket::Released) {
            Socket::Allocated(socket) => {
                socket.set_nodelay(true).ok();
                self.socket = Socket::Connecting(Box::pin(socket.connect(addr)));
                Ok(())
            }
            other => {
                self.socket = other;
                Err(TunnelError::NotConnected(self.id))
            }
        }
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Drive the pending connect. Resolves once, moving the stream to
    /// `Open` on success or `Closed` (socket released) on failure.
    pub fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Socket::Connecting(connect) = &mut self.socket else {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        };

        match connect.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(stream)) => {
                self.socket = Socket::Connected(stream);
                self.state = StreamState::Open;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.close();
                Poll::Ready(Err(e))
            }
        }
    }

    /// Wait until the connected socket has something to read (data, EOF or
    /// an error).
    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.socket {
            Socket::Connected(stream) if self.state == StreamState::Open => {
                stream.poll_read_ready(cx)
            }
            _ => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    /// Write all of `data`, looping over partial writes. Fails on the first
    /// failed write, or if the stream is not open.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        let stream = match &mut self.socket {
            Socket::Connected(stream) if self.state == StreamState::Open => stream,
            _ => return Err(TunnelError::StreamClosed(self.id)),
        };

        let mut remaining = data;
        while !remaining.is_empty() {
            let n = stream.write(remaining).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Read up to `max` bytes without blocking
    pub fn read(&mut self, max: usize) -> Result<ReadOutcome, TunnelError> {
        let stream = match &self.socket {
            Socket::Connected(stream) if self.state == StreamState::Open => stream,
            _ => return Err(TunnelError::StreamClosed(self.id)),
        };

        let mut buf = vec![0u8; max];
        match stream.try_read(&mut buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                buf.truncate(n);
                Ok(ReadOutcome::Data(Bytes::from(buf)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the stream failed without releasing the socket yet
    pub fn mark_failed(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Release the socket. Idempotent.
    pub fn close(&mut self) {
        self.socket = Socket::Released;
        self.state = StreamState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TunnelStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut stream = TunnelStream::create(1, &addr).unwrap();
        assert_eq!(stream.state(), StreamState::Connecting);
        stream.begin_connect(addr).unwrap();

        let (connect, accept) = tokio::join!(poll_fn(|cx| stream.poll_connect(cx)), listener.accept());
        connect.unwrap();
        let (peer, _) = accept.unwrap();
        (stream, peer)
    }

    #[tokio::test]
    async fn test_connect_send_read() {
        let (mut stream, mut peer) = connected_pair().await;
        assert!(stream.is_open());

        stream.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        poll_fn(|cx| stream.poll_read_ready(cx)).await.unwrap();
        assert_eq!(
            stream.read(8192).unwrap(),
            ReadOutcome::Data(Bytes::from_static(b"pong"))
        );
    }

    #[tokio::test]
    async fn test_peer_close_reads_eof() {
        let (mut stream, peer) = connected_pair().await;
        drop(peer);

        poll_fn(|cx| stream.poll_read_ready(cx)).await.unwrap();
        assert_eq!(stream.read(8192).unwrap(), ReadOutcome::Eof);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut stream, _peer) = connected_pair().await;
        stream.close();
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.send(b"x").await.is_err());
        assert!(stream.read(16).is_err());
    }

    #[tokio::test]
    async fn test_refused_connect() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let mut stream = TunnelStream::create(2, &addr).unwrap();
        stream.begin_connect(addr).unwrap();

        let err = poll_fn(|cx| stream.poll_connect(cx)).await.unwrap_err();
        assert!(err.raw_os_error().is_some());
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut stream = TunnelStream::create(3, &addr).unwrap();
        assert!(matches!(
            stream.send(b"early").await,
            Err(TunnelError::StreamClosed(3))
        ));
    }
}
