//! Client error types.

use rpcmux_core::{ErrorKind, MuxError};
use rpcmux_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Call(#[from] MuxError),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("call timeout")]
    Timeout,

    #[error("stream ended without a response")]
    MissingResponse,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl ClientError {
    /// Taxonomy of the failure, when it came from the connection.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Call(e) => Some(e.kind()),
            ClientError::Io(_) | ClientError::ConnectTimeout => Some(ErrorKind::Transport),
            ClientError::MissingResponse => Some(ErrorKind::Protocol),
            ClientError::Timeout
            | ClientError::InvalidEndpoint(_)
            | ClientError::TlsConfig(_) => None,
        }
    }

    /// The reset code, if the call was ended by a stream reset or a
    /// connection failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Call(e) => Some(e.code()),
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::ConnectTimeout | ClientError::Timeout => true,
            ClientError::Call(e) => e.code().is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux_protocol::ResetReason;

    #[test]
    fn test_reset_errors() {
        let err = ClientError::from(MuxError::Reset {
            stream_id: 1,
            reason: ResetReason::new(ErrorCode::RefusedStream, "limit"),
        });
        assert_eq!(err.kind(), Some(ErrorKind::StreamReset));
        assert_eq!(err.code(), Some(ErrorCode::RefusedStream));
        assert!(err.is_retryable());

        let err = ClientError::from(MuxError::Reset {
            stream_id: 1,
            reason: ResetReason::new(ErrorCode::HandlerFailed, "bad input"),
        });
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bad input"));
    }

    #[test]
    fn test_transport_errors() {
        let err = ClientError::ConnectTimeout;
        assert_eq!(err.kind(), Some(ErrorKind::Transport));
        assert!(err.is_retryable());
        assert!(ClientError::TlsConfig("x".into()).kind().is_none());
    }
}
