//! JSON payloads carried by control-bearing frames.
//!
//! Data-frame payloads are opaque bytes and never pass through here.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Payload of an Open frame: which operation the new stream invokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Operation identifier the server dispatches on.
    pub op: String,

    /// Free-form call metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl OpenRequest {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Payload of an Error frame, and the recorded cause of every stream reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReason {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable cause.
    pub message: String,
}

impl ResetReason {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "stream cancelled")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportError, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, message)
    }

    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::ShuttingDown, "connection shutting down")
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
