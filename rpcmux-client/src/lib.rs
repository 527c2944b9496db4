//! # rpcmux-client
//!
//! Client library for rpcmux.
//!
//! This crate provides:
//! - Connectors for TCP, Unix-domain sockets and TLS over either
//! - Unary, server-streaming, client-streaming and duplex call helpers
//! - Per-connection TLS settings, including an opt-in insecure mode

pub mod client;
pub mod connector;
pub mod error;
pub mod stream;
pub mod tls;

pub use client::Client;
pub use connector::{connect, ConnectConfig, Endpoint, TlsClientConfig};
pub use error::ClientError;
pub use stream::{ClientStreamingCall, ResponseStream};
