//! Transport core for rpcmux.
//!
//! Layers, bottom up:
//!
//! - [`transport`]: duplex byte streams (TCP, local pipes, TLS)
//! - [`framed`]: frame reader and policy-driven frame writer
//! - [`mux`] / [`stream`]: stream table, state machine, per-stream queues
//! - [`connection`]: the driver tying a transport to a multiplexer
//!
//! Plus [`completion`], the lazily allocated completion signal used for
//! stream and connection closure.

pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod framed;
pub mod mux;
pub mod stream;
pub mod transport;

pub use completion::{Completion, LazyCompletion, Outcome};
pub use config::{MuxConfig, WritePolicy};
pub use connection::{Connection, IncomingStreams};
pub use error::{ErrorKind, MuxError};
pub use framed::{FrameConnection, FrameReader, FrameSink, FrameWriter, WriterStats};
pub use mux::{ConnectionPhase, Role};
pub use stream::{RpcStream, StreamHandle, StreamReceiver, StreamSender, StreamState};
pub use transport::{AsyncIo, ConnectionState, DuplexStream, PeerAddr};

pub use rpcmux_protocol::{ErrorCode, OpenRequest, ResetReason};
