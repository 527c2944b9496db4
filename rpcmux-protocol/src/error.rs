//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors. Every variant is fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unknown frame kind: {0:#x}")]
    UnknownFrameKind(u8),

    #[error("frame kind {kind} not allowed on stream {stream_id}")]
    InvalidStreamId { kind: &'static str, stream_id: u32 },

    #[error("stream id violation: {0}")]
    StreamIdViolation(String),

    #[error("truncated frame: connection closed with {buffered} bytes pending")]
    TruncatedFrame { buffered: usize },

    #[error("malformed {what} payload: {source}")]
    MalformedPayload {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable error codes carried in reset reasons.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The stream was cancelled by either side.
    Cancelled,
    /// No handler is registered for the requested operation.
    UnknownOperation,
    /// The handler returned an error.
    HandlerFailed,
    /// The peer refused to open the stream (stream limit or draining).
    RefusedStream,
    /// A frame on this stream violated the protocol.
    ProtocolError,
    /// The underlying transport failed.
    TransportError,
    /// The peer is shutting down.
    ShuttingDown,
    /// Unexpected internal failure.
    InternalError,
}

impl ErrorCode {
    /// Returns whether a call that failed with this code may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RefusedStream | ErrorCode::TransportError | ErrorCode::ShuttingDown
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Cancelled => write!(f, "CANCELLED"),
            ErrorCode::UnknownOperation => write!(f, "UNKNOWN_OPERATION"),
            ErrorCode::HandlerFailed => write!(f, "HANDLER_FAILED"),
            ErrorCode::RefusedStream => write!(f, "REFUSED_STREAM"),
            ErrorCode::ProtocolError => write!(f, "PROTOCOL_ERROR"),
            ErrorCode::TransportError => write!(f, "TRANSPORT_ERROR"),
            ErrorCode::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::RefusedStream.is_retryable());
        assert!(ErrorCode::TransportError.is_retryable());
        assert!(ErrorCode::ShuttingDown.is_retryable());

        assert!(!ErrorCode::Cancelled.is_retryable());
        assert!(!ErrorCode::UnknownOperation.is_retryable());
        assert!(!ErrorCode::HandlerFailed.is_retryable());
        assert!(!ErrorCode::ProtocolError.is_retryable());
        assert!(!ErrorCode::InternalError.is_retryable());
    }

    #[test]
    fn test_error_code_display_matches_serde() {
        for code in [
            ErrorCode::Cancelled,
            ErrorCode::UnknownOperation,
            ErrorCode::HandlerFailed,
            ErrorCode::RefusedStream,
            ErrorCode::ProtocolError,
            ErrorCode::TransportError,
            ErrorCode::ShuttingDown,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }

    #[test]
    fn test_error_code_deserialize() {
        let parsed: ErrorCode = serde_json::from_str("\"REFUSED_STREAM\"").unwrap();
        assert_eq!(parsed, ErrorCode::RefusedStream);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::UnknownFrameKind(0x7f);
        assert!(err.to_string().contains("7f"));

        let err = ProtocolError::InvalidStreamId {
            kind: "PING",
            stream_id: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("PING") && msg.contains('3'));

        let err = ProtocolError::TruncatedFrame { buffered: 7 };
        assert!(err.to_string().contains('7'));
    }
}
