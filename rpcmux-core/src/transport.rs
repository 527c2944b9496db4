//! Duplex transport adapters.
//!
//! Every concrete byte source/sink (TCP socket, local pipe, TLS session) is
//! carried as a [`DuplexStream`]. TLS wraps another `DuplexStream`, so it
//! composes over any of the other variants. Nothing here looks at frames.

use crate::error::MuxError;
use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use uuid::Uuid;

/// Any async byte stream that can back a connection.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pin_project! {
    /// A byte transport: plain TCP, a local pipe (Unix socket, named pipe,
    /// in-memory duplex) or TLS layered over another `DuplexStream`.
    #[project = DuplexProj]
    pub enum DuplexStream {
        Tcp { #[pin] stream: TcpStream },
        Pipe { #[pin] stream: Box<dyn AsyncIo> },
        ServerTls { #[pin] stream: Box<ServerTlsStream<DuplexStream>> },
        ClientTls { #[pin] stream: Box<ClientTlsStream<DuplexStream>> },
    }
}

impl DuplexStream {
    /// Wraps a local pipe or any other async byte stream.
    pub fn pipe(stream: impl AsyncIo + 'static) -> Self {
        DuplexStream::Pipe {
            stream: Box::new(stream),
        }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(
            self,
            DuplexStream::ServerTls { .. } | DuplexStream::ClientTls { .. }
        )
    }

    pub fn transport_name(&self) -> &'static str {
        match self {
            DuplexStream::Tcp { .. } => "tcp",
            DuplexStream::Pipe { .. } => "pipe",
            DuplexStream::ServerTls { .. } | DuplexStream::ClientTls { .. } => "tls",
        }
    }

    /// Shuts down the write side; the peer observes end of stream.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("transport", &self.transport_name())
            .finish()
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            DuplexProj::Tcp { stream } => stream.poll_read(cx, buf),
            DuplexProj::Pipe { stream } => stream.poll_read(cx, buf),
            DuplexProj::ServerTls { stream } => stream.poll_read(cx, buf),
            DuplexProj::ClientTls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            DuplexProj::Tcp { stream } => stream.poll_write(cx, buf),
            DuplexProj::Pipe { stream } => stream.poll_write(cx, buf),
            DuplexProj::ServerTls { stream } => stream.poll_write(cx, buf),
            DuplexProj::ClientTls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DuplexProj::Tcp { stream } => stream.poll_flush(cx),
            DuplexProj::Pipe { stream } => stream.poll_flush(cx),
            DuplexProj::ServerTls { stream } => stream.poll_flush(cx),
            DuplexProj::ClientTls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            DuplexProj::Tcp { stream } => stream.poll_shutdown(cx),
            DuplexProj::Pipe { stream } => stream.poll_shutdown(cx),
            DuplexProj::ServerTls { stream } => stream.poll_shutdown(cx),
            DuplexProj::ClientTls { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// Identity of the remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Pipe(String),
    Memory,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Pipe(name) => write!(f, "pipe:{}", name),
            PeerAddr::Memory => write!(f, "memory"),
        }
    }
}

/// A ready transport plus the metadata a connection is logged under.
pub struct ConnectionState {
    pub transport: DuplexStream,
    /// Unique connection id.
    pub id: String,
    pub peer: PeerAddr,
    /// Span every log line of this connection is recorded in.
    pub span: tracing::Span,
}

impl ConnectionState {
    pub fn new(transport: DuplexStream, peer: PeerAddr) -> Self {
        let id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("conn", id = %&id[..8], peer = %peer);
        Self {
            transport,
            id,
            peer,
            span,
        }
    }

    /// Adopts an accepted or connected TCP socket.
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true).ok();
        Ok(Self::new(DuplexStream::Tcp { stream }, PeerAddr::Tcp(peer)))
    }

    /// Adopts a local pipe.
    pub fn pipe(stream: impl AsyncIo + 'static, name: impl Into<String>) -> Self {
        Self::new(DuplexStream::pipe(stream), PeerAddr::Pipe(name.into()))
    }

    /// Adopts an in-memory stream (tests, in-process peers).
    pub fn memory(stream: impl AsyncIo + 'static) -> Self {
        Self::new(DuplexStream::pipe(stream), PeerAddr::Memory)
    }

    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Performs the server side of a TLS handshake over the current transport.
    pub async fn accept_tls(self, acceptor: &TlsAcceptor) -> Result<Self, MuxError> {
        let Self {
            transport,
            id,
            peer,
            span,
        } = self;
        tracing::debug!(parent: &span, "Performing TLS handshake");
        let stream = acceptor
            .accept(transport)
            .await
            .map_err(|e| MuxError::TlsHandshake(e.to_string()))?;
        tracing::debug!(parent: &span, "TLS handshake complete");
        Ok(Self {
            transport: DuplexStream::ServerTls {
                stream: Box::new(stream),
            },
            id,
            peer,
            span,
        })
    }

    /// Performs the client side of a TLS handshake over the current transport.
    pub async fn connect_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<Self, MuxError> {
        let Self {
            transport,
            id,
            peer,
            span,
        } = self;
        tracing::debug!(parent: &span, "Performing TLS handshake");
        let stream = connector
            .connect(server_name, transport)
            .await
            .map_err(|e| MuxError::TlsHandshake(e.to_string()))?;
        tracing::debug!(parent: &span, "TLS handshake complete");
        Ok(Self {
            transport: DuplexStream::ClientTls {
                stream: Box::new(stream),
            },
            id,
            peer,
            span,
        })
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("transport", &self.transport)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_pipe_moves_bytes_both_ways() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = DuplexStream::pipe(a);
        let mut right = DuplexStream::pipe(b);

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await.unwrap();
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_close_signals_end_of_stream() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = DuplexStream::pipe(a);
        let mut right = DuplexStream::pipe(b);

        left.close().await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tcp_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let _client = connect.await.unwrap();

        let state = ConnectionState::tcp(accepted).unwrap();
        assert!(matches!(state.peer, PeerAddr::Tcp(_)));
        assert!(!state.is_tls());
        assert_eq!(state.transport.transport_name(), "tcp");
        assert_eq!(state.id.len(), 36);
    }

    #[test]
    fn test_peer_display() {
        assert_eq!(PeerAddr::Pipe("/tmp/x.sock".into()).to_string(), "pipe:/tmp/x.sock");
        assert_eq!(PeerAddr::Memory.to_string(), "memory");
    }
}
