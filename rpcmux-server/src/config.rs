//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RPCMUX_CONFIG)
//! 3. Environment variables

use rpcmux_core::{MuxConfig, WritePolicy};
use rpcmux_protocol::{DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listeners accepting connections.
    pub listeners: ListenersConfig,
    /// Per-connection limits and timers.
    pub connection: ConnectionConfig,
    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RPCMUX_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.listeners.apply_env_overrides();
        self.connection.apply_env_overrides();
        self.shutdown.apply_env_overrides();
    }

    /// Checks the configuration for settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listeners.validate()?;
        self.connection.validate()?;
        Ok(())
    }

    /// Transport settings for connections accepted on `listener`.
    pub fn mux_config(&self, listener: &ListenerConfig) -> MuxConfig {
        let mut mux = MuxConfig::new()
            .with_write_policy(listener.buffering)
            .with_max_payload_size(self.connection.max_payload_size)
            .with_max_streams(self.connection.max_streams)
            .with_stream_queue_capacity(self.connection.stream_queue_capacity)
            .with_write_queue_capacity(self.connection.write_queue_capacity);
        if let Some(interval) = self.connection.ping_interval() {
            mux = mux.with_ping_interval(interval);
        }
        if let Some(timeout) = self.connection.idle_timeout() {
            mux = mux.with_idle_timeout(timeout);
        }
        mux
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// The configured listeners, serialized as a plain list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenersConfig(pub Vec<ListenerConfig>);

impl Default for ListenersConfig {
    fn default() -> Self {
        Self(vec![ListenerConfig::default()])
    }
}

impl ListenersConfig {
    pub fn iter(&self) -> std::slice::Iter<'_, ListenerConfig> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `RPCMUX_BIND` and `RPCMUX_TLS_*` apply to the first TCP listener.
    fn apply_env_overrides(&mut self) {
        let Some(listener) = self
            .0
            .iter_mut()
            .find(|l| matches!(l.transport, TransportConfig::Tcp { .. }))
        else {
            return;
        };

        if let Ok(addr) = std::env::var("RPCMUX_BIND") {
            if let Ok(parsed) = addr.parse() {
                listener.transport = TransportConfig::Tcp { bind_addr: parsed };
            }
        }

        if let Ok(buffering) = std::env::var("RPCMUX_BUFFERING") {
            if let Some(policy) = parse_write_policy(&buffering) {
                listener.buffering = policy;
            }
        }

        let enabled = match std::env::var("RPCMUX_TLS_ENABLED") {
            Ok(v) => v == "1" || v.to_lowercase() == "true",
            Err(_) => listener.tls.is_some(),
        };
        let mut tls = listener.tls.take().unwrap_or_default();
        tls.apply_env_overrides();
        listener.tls = enabled.then_some(tls);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one listener must be configured".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for listener in &self.0 {
            if !names.insert(listener.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate listener name '{}'",
                    listener.name
                )));
            }
            if let Some(ref tls) = listener.tls {
                tls.validate().map_err(|e| match e {
                    ConfigError::ValidationError(msg) => ConfigError::ValidationError(format!(
                        "listener '{}': {}",
                        listener.name, msg
                    )),
                    other => other,
                })?;
            }
        }
        Ok(())
    }
}

/// One listener: where to accept, whether to wrap in TLS, how to buffer writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Name used in logs.
    pub name: String,
    /// Where to accept connections.
    pub transport: TransportConfig,
    /// TLS settings; plain transport when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    /// Write buffering policy for accepted connections.
    #[serde(default)]
    pub buffering: WritePolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            transport: TransportConfig::Tcp {
                bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            },
            tls: None,
            buffering: WritePolicy::default(),
        }
    }
}

impl ListenerConfig {
    pub fn tcp(name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Tcp { bind_addr },
            tls: None,
            buffering: WritePolicy::default(),
        }
    }

    pub fn unix(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Unix { path: path.into() },
            tls: None,
            buffering: WritePolicy::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_buffering(mut self, policy: WritePolicy) -> Self {
        self.buffering = policy.normalized();
        self
    }
}

/// Transport a listener accepts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// TCP socket.
    Tcp {
        #[serde(with = "socket_addr_serde")]
        bind_addr: SocketAddr,
    },
    /// Unix-domain socket (local pipe).
    Unix { path: PathBuf },
}

/// Per-connection limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum concurrent connections across all listeners.
    pub max_connections: usize,
    /// Maximum live streams per connection.
    pub max_streams: usize,
    /// Inbound queue depth per stream, in frames.
    pub stream_queue_capacity: usize,
    /// Outbound frame queue depth per connection.
    pub write_queue_capacity: usize,
    /// Largest frame payload accepted or produced.
    pub max_payload_size: u32,
    /// Keepalive ping interval in seconds (0 = disabled).
    pub ping_interval_secs: u64,
    /// Idle connection timeout in seconds (0 = disabled).
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let mux = MuxConfig::default();
        Self {
            max_connections: 1000,
            max_streams: mux.max_streams,
            stream_queue_capacity: mux.stream_queue_capacity,
            write_queue_capacity: mux.write_queue_capacity,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            ping_interval_secs: 30,
            idle_timeout_secs: 300,
        }
    }
}

impl ConnectionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("RPCMUX_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(max) = std::env::var("RPCMUX_MAX_STREAMS") {
            if let Ok(n) = max.parse() {
                self.max_streams = n;
            }
        }

        if let Ok(capacity) = std::env::var("RPCMUX_STREAM_QUEUE") {
            if let Ok(n) = capacity.parse() {
                self.stream_queue_capacity = n;
            }
        }

        if let Ok(size) = std::env::var("RPCMUX_MAX_PAYLOAD") {
            if let Ok(n) = size.parse() {
                self.max_payload_size = n;
            }
        }

        if let Ok(interval) = std::env::var("RPCMUX_PING_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.ping_interval_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("RPCMUX_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_streams == 0 {
            return Err(ConfigError::ValidationError(
                "max_streams must be greater than 0".to_string(),
            ));
        }
        if self.stream_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stream_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "write_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_payload_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long live streams get to finish before connections are force-closed.
    pub drain_deadline_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_deadline_secs: 10,
        }
    }
}

impl ShutdownConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(deadline) = std::env::var("RPCMUX_DRAIN_DEADLINE") {
            if let Ok(secs) = deadline.parse() {
                self.drain_deadline_secs = secs;
            }
        }
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_deadline_secs)
    }
}

/// TLS configuration for one listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            ..Default::default()
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("RPCMUX_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("RPCMUX_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("RPCMUX_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = require == "1" || require.to_lowercase() == "true";
        }
        if let Ok(path) = std::env::var("RPCMUX_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses `merge`, `passthrough` or `buffered:<bytes>`.
pub fn parse_write_policy(value: &str) -> Option<WritePolicy> {
    match value.to_lowercase().as_str() {
        "merge" => Some(WritePolicy::Merge),
        "passthrough" => Some(WritePolicy::Passthrough),
        s if s.starts_with("buffered:") => s[9..]
            .parse()
            .ok()
            .map(|n| WritePolicy::Buffered(n).normalized()),
        _ => None,
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listeners.len(), 1);
        let listener = &config.listeners.0[0];
        assert_eq!(
            listener.transport,
            TransportConfig::Tcp {
                bind_addr: "127.0.0.1:7411".parse().unwrap()
            }
        );
        assert_eq!(listener.buffering, WritePolicy::Merge);
        assert_eq!(config.shutdown.drain_deadline(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_listeners() {
        let yaml = r#"
listeners:
  - name: public
    transport:
      type: tcp
      bind_addr: "0.0.0.0:9000"
    buffering: passthrough
  - name: local
    transport:
      type: unix
      path: /tmp/rpcmux-test.sock
connection:
  max_streams: 16
  ping_interval_secs: 0
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners.0[0].buffering, WritePolicy::Passthrough);
        assert_eq!(
            config.listeners.0[1].transport,
            TransportConfig::Unix {
                path: PathBuf::from("/tmp/rpcmux-test.sock")
            }
        );
        assert_eq!(config.listeners.0[1].buffering, WritePolicy::Merge);
        assert_eq!(config.connection.max_streams, 16);
        assert!(config.connection.ping_interval().is_none());
        // Unspecified sections keep their defaults.
        assert_eq!(config.connection.max_connections, 1000);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.listeners.0[0].buffering = WritePolicy::Buffered(65536);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.listeners.0[0].buffering, WritePolicy::Buffered(65536));
        assert_eq!(
            parsed.listeners.0[0].transport,
            config.listeners.0[0].transport
        );
    }

    #[test]
    fn test_validate_rejects_empty_listeners() {
        let mut config = Config::default();
        config.listeners.0.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = Config::default();
        config.connection.stream_queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stream_queue_capacity"));
    }

    #[test]
    fn test_validate_rejects_incomplete_tls() {
        let mut config = Config::default();
        config.listeners.0[0].tls = Some(TlsConfig {
            cert_path: Some("/etc/rpcmux/cert.pem".into()),
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_path"));
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = Config::default();
        config
            .listeners
            .0
            .push(ListenerConfig::unix("default", "/tmp/x.sock"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_write_policy() {
        assert_eq!(parse_write_policy("merge"), Some(WritePolicy::Merge));
        assert_eq!(
            parse_write_policy("Passthrough"),
            Some(WritePolicy::Passthrough)
        );
        assert_eq!(
            parse_write_policy("buffered:4096"),
            Some(WritePolicy::Buffered(4096))
        );
        assert_eq!(
            parse_write_policy("buffered:0"),
            Some(WritePolicy::Passthrough)
        );
        assert_eq!(parse_write_policy("fast"), None);
    }

    #[test]
    fn test_mux_config_from_listener() {
        let mut config = Config::default();
        config.connection.idle_timeout_secs = 0;
        let listener = ListenerConfig::unix("local", "/tmp/x.sock")
            .with_buffering(WritePolicy::Buffered(1024));
        let mux = config.mux_config(&listener);
        assert_eq!(mux.write_policy, WritePolicy::Buffered(1024));
        assert_eq!(mux.ping_interval, Some(Duration::from_secs(30)));
        assert!(mux.idle_timeout.is_none());
    }
}
