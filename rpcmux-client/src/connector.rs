//! Endpoints, connect settings and transport establishment.

use crate::error::ClientError;
use crate::tls::create_tls_connector;
use rpcmux_core::{Connection, ConnectionState, IncomingStreams, MuxConfig};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port`, resolved at connect time.
    Tcp(String),
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    /// Host part of a TCP endpoint, without brackets for IPv6 literals.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp(addr) => {
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                Some(host.trim_start_matches('[').trim_end_matches(']'))
            }
            Endpoint::Unix(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Accepts `host:port`, `tcp://host:port`, `unix://path` and `unix:path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(ClientError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::unix(path));
        }
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::tcp(addr))
            }
            _ => Err(ClientError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the web-pki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the endpoint host, or `localhost`
    /// for Unix sockets).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub endpoint: Endpoint,
    /// Bound on establishing the transport, TLS handshake included.
    pub connect_timeout: Duration,
    /// Bound on unary calls; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// TLS settings; plain transport when absent.
    pub tls: Option<TlsClientConfig>,
    pub mux: MuxConfig,
}

impl ConnectConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Some(Duration::from_secs(30)),
            tls: None,
            mux: MuxConfig::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }
}

/// Opens the transport described by `config` and starts a client
/// connection over it.
pub async fn connect(config: &ConnectConfig) -> Result<(Connection, IncomingStreams), ClientError> {
    tracing::debug!(endpoint = %config.endpoint, "Connecting");
    let state = tokio::time::timeout(config.connect_timeout, establish(config))
        .await
        .map_err(|_| {
            tracing::debug!(endpoint = %config.endpoint, "Connect timeout");
            ClientError::ConnectTimeout
        })??;
    tracing::debug!(
        endpoint = %config.endpoint,
        transport = state.transport.transport_name(),
        "Connected"
    );
    Ok(Connection::client(state, config.mux.clone()))
}

async fn establish(config: &ConnectConfig) -> Result<ConnectionState, ClientError> {
    let state = match &config.endpoint {
        Endpoint::Tcp(addr) => ConnectionState::tcp(TcpStream::connect(addr.as_str()).await?)?,
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            ConnectionState::pipe(stream, path.display().to_string())
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => {
            return Err(ClientError::InvalidEndpoint(
                "unix-domain sockets are not supported on this platform".into(),
            ))
        }
    };

    match &config.tls {
        Some(tls) => {
            let host = config.endpoint.host().unwrap_or("localhost");
            let (connector, server_name) = create_tls_connector(tls, host)?;
            Ok(state.connect_tls(&connector, server_name).await?)
        }
        None => Ok(state),
    }
}
