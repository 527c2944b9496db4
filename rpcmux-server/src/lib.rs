//! # rpcmux-server
//!
//! Server for rpcmux.
//!
//! This crate provides:
//! - Listeners over TCP and Unix-domain sockets, each optionally TLS-wrapped
//! - A service registry mapping operation names to handlers
//! - Unary, server-streaming, client-streaming and duplex call shapes
//! - Graceful shutdown with a drain deadline
//! - YAML and environment configuration

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod listener;
pub mod server;
pub mod tls;

pub use config::{
    Config, ConfigError, ConnectionConfig, ListenerConfig, ShutdownConfig, TlsConfig,
    TransportConfig,
};
pub use diagnostics::register_diagnostics;
pub use error::ServerError;
pub use handler::{
    CallContext, CallError, CallOutcome, Handler, ServerCall, ServerStreamWriter, ServiceRegistry,
};
pub use listener::{BoundListener, ListenAddr};
pub use server::{Server, ServerStats, StatsSnapshot};
