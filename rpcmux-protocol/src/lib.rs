//! # rpcmux-protocol
//!
//! Wire protocol implementation for rpcmux.
//!
//! This crate provides:
//! - The fixed 12-byte frame header and its encoder
//! - A resumable frame decoder that tolerates partial reads
//! - Reset reasons and stable error codes carried by Error frames
//! - The Open-frame request header

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::FrameDecoder;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameFlags, FrameHeader, FrameKind, FRAME_HEADER_SIZE};
pub use message::{OpenRequest, ResetReason};

/// Default port for an rpcmux server.
pub const DEFAULT_PORT: u16 = 7411;

/// Default maximum frame payload size (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Stream id reserved for connection-level control frames.
pub const CONTROL_STREAM_ID: u32 = 0;

/// ALPN protocol id advertised by both ends of a TLS connection.
pub const ALPN_PROTOCOL: &[u8] = b"rpcmux/1";
