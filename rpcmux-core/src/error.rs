//! Transport error types.

use crate::stream::StreamState;
use rpcmux_protocol::{ErrorCode, ProtocolError, ResetReason};
use thiserror::Error;

/// Coarse error taxonomy shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or disallowed traffic. Fatal to the connection.
    Protocol,
    /// One stream failed. Siblings and the connection carry on.
    StreamReset,
    /// The byte transport failed. Fatal to the connection.
    Transport,
}

/// Errors raised by connections, the multiplexer and streams.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("stream {stream_id} reset: {reason}")]
    Reset {
        stream_id: u32,
        reason: ResetReason,
    },

    #[error("connection closed: {0}")]
    ConnectionClosed(ResetReason),

    #[error("stream limit reached ({max} in flight)")]
    StreamLimit { max: usize },

    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    #[error("stream {stream_id}: cannot {action} in state {state:?}")]
    InvalidState {
        stream_id: u32,
        action: &'static str,
        state: StreamState,
    },

    #[error("connection is draining")]
    Draining,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("timed out")]
    Timeout,
}

impl MuxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::Io(_) | MuxError::TlsHandshake(_) | MuxError::Timeout => ErrorKind::Transport,
            MuxError::Protocol(_) => ErrorKind::Protocol,
            MuxError::ConnectionClosed(reason) if reason.code == ErrorCode::ProtocolError => {
                ErrorKind::Protocol
            }
            MuxError::ConnectionClosed(_) => ErrorKind::Transport,
            MuxError::Reset { .. }
            | MuxError::StreamLimit { .. }
            | MuxError::StreamIdsExhausted
            | MuxError::InvalidState { .. }
            | MuxError::Draining => ErrorKind::StreamReset,
        }
    }

    /// The reason reported to streams and peers when this error ends them.
    pub fn reset_reason(&self) -> ResetReason {
        match self {
            MuxError::Reset { reason, .. } | MuxError::ConnectionClosed(reason) => reason.clone(),
            MuxError::Protocol(e) => ResetReason::protocol(e.to_string()),
            MuxError::Io(e) => ResetReason::transport(e.to_string()),
            MuxError::TlsHandshake(msg) => ResetReason::transport(msg.clone()),
            MuxError::Timeout => ResetReason::transport("timed out"),
            MuxError::StreamLimit { .. } | MuxError::StreamIdsExhausted | MuxError::Draining => {
                ResetReason::new(ErrorCode::RefusedStream, self.to_string())
            }
            MuxError::InvalidState { .. } => ResetReason::protocol(self.to_string()),
        }
    }

    /// Returns the error code, if the error maps onto one.
    pub fn code(&self) -> ErrorCode {
        self.reset_reason().code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = MuxError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "gone",
        ));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.code(), ErrorCode::TransportError);

        let err = MuxError::Protocol(ProtocolError::UnknownFrameKind(9));
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err = MuxError::Reset {
            stream_id: 3,
            reason: ResetReason::transport("connection lost"),
        };
        assert_eq!(err.kind(), ErrorKind::StreamReset);
        assert_eq!(err.code(), ErrorCode::TransportError);

        let err = MuxError::ConnectionClosed(ResetReason::protocol("bad frame"));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_display_carries_cause() {
        let err = MuxError::Reset {
            stream_id: 7,
            reason: ResetReason::new(ErrorCode::HandlerFailed, "division by zero"),
        };
        let msg = err.to_string();
        assert!(msg.contains("stream 7"));
        assert!(msg.contains("HANDLER_FAILED"));
        assert!(msg.contains("division by zero"));
    }
}
