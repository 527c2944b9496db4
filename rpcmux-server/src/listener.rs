//! Bound listeners producing ready connection states.

use crate::config::{ListenerConfig, TransportConfig};
use crate::error::ServerError;
use crate::tls::create_tls_acceptor;
use rpcmux_core::{ConnectionState, MuxConfig};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_rustls::TlsAcceptor;

/// Address a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddr {
    /// The TCP address, if this is a TCP listener.
    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            ListenAddr::Tcp(addr) => Some(*addr),
            ListenAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

/// A listener bound to its address, with its TLS acceptor and the transport
/// settings its connections run with.
pub struct BoundListener {
    name: String,
    inner: Inner,
    tls: Option<TlsAcceptor>,
    mux: MuxConfig,
}

impl BoundListener {
    /// Binds the listener described by `config`.
    pub async fn bind(config: &ListenerConfig, mux: MuxConfig) -> Result<Self, ServerError> {
        let tls = config.tls.as_ref().map(create_tls_acceptor).transpose()?;
        let bind_err = |source| ServerError::Bind {
            listener: config.name.clone(),
            source,
        };

        let inner = match &config.transport {
            TransportConfig::Tcp { bind_addr } => {
                Inner::Tcp(TcpListener::bind(bind_addr).await.map_err(bind_err)?)
            }
            #[cfg(unix)]
            TransportConfig::Unix { path } => {
                remove_stale_socket(path).map_err(bind_err)?;
                Inner::Unix(UnixListener::bind(path).map_err(bind_err)?, path.clone())
            }
            #[cfg(not(unix))]
            TransportConfig::Unix { .. } => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix-domain listeners are not supported on this platform",
                )))
            }
        };

        let listener = Self {
            name: config.name.clone(),
            inner,
            tls,
            mux,
        };
        tracing::info!(
            listener = %listener.name,
            addr = %listener.local_addr()?,
            tls = listener.is_tls(),
            buffering = ?listener.mux.write_policy,
            "Listener bound"
        );
        Ok(listener)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn mux_config(&self) -> &MuxConfig {
        &self.mux
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match &self.inner {
            Inner::Tcp(listener) => listener.local_addr().map(ListenAddr::Tcp),
            #[cfg(unix)]
            Inner::Unix(_, path) => Ok(ListenAddr::Unix(path.clone())),
        }
    }

    /// Accepts the next raw transport. The TLS handshake is left to
    /// [`BoundListener::handshake`] so it runs off the accept loop.
    pub async fn accept(&self) -> io::Result<ConnectionState> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                ConnectionState::tcp(stream)
            }
            #[cfg(unix)]
            Inner::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok(ConnectionState::pipe(stream, path.display().to_string()))
            }
        }
    }

    /// Completes transport setup for an accepted connection.
    pub async fn handshake(&self, state: ConnectionState) -> Result<ConnectionState, ServerError> {
        match &self.tls {
            Some(acceptor) => state
                .accept_tls(acceptor)
                .await
                .map_err(|e| ServerError::TlsHandshake(e.to_string())),
            None => Ok(state),
        }
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Inner::Unix(_, path) = &self.inner {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundListener")
            .field("name", &self.name)
            .field("addr", &self.local_addr().ok())
            .field("tls", &self.is_tls())
            .finish()
    }
}

/// Removes a socket file left behind by a previous run. Anything that is not
/// a socket is left alone and makes the bind fail.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
#[allow(dead_code)]
fn remove_stale_socket(_path: &Path) -> io::Result<()> {
    Ok(())
}
