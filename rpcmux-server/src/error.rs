//! Server error types.

use crate::config::ConfigError;
use rpcmux_core::MuxError;
use rpcmux_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Mux(#[from] MuxError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("listener '{listener}' failed to bind: {source}")]
    Bind {
        listener: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server not bound; call bind() first")]
    NotBound,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ServerError {
    /// Converts to the reset code reported to peers.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Mux(e) => e.code(),
            ServerError::ShuttingDown => ErrorCode::ShuttingDown,
            ServerError::Io(_) | ServerError::TlsHandshake(_) => ErrorCode::TransportError,
            ServerError::Config(_)
            | ServerError::Bind { .. }
            | ServerError::AlreadyRunning
            | ServerError::NotBound
            | ServerError::TlsConfig(_) => ErrorCode::InternalError,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux_protocol::ResetReason;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ServerError::ShuttingDown.error_code(),
            ErrorCode::ShuttingDown
        );
        assert!(ServerError::ShuttingDown.is_retryable());

        let err = ServerError::Mux(MuxError::Reset {
            stream_id: 1,
            reason: ResetReason::new(ErrorCode::UnknownOperation, "no such op"),
        });
        assert_eq!(err.error_code(), ErrorCode::UnknownOperation);
        assert!(!err.is_retryable());

        let err = ServerError::TlsConfig("bad key".into());
        assert_eq!(err.error_code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_bind_error_names_listener() {
        let err = ServerError::Bind {
            listener: "public".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("public"));
    }
}
