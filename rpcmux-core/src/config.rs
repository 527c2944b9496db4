//! Per-connection transport settings.

use rpcmux_protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of live streams per connection.
pub const DEFAULT_MAX_STREAMS: usize = 1024;

/// Default per-stream inbound queue depth, in frames.
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 64;

/// Default depth of the outbound frame queue feeding the writer task.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;

/// How outbound frames are turned into physical writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Frames queued within one scheduling turn go out in a single write.
    #[default]
    Merge,
    /// Frames accumulate in a buffer of this many bytes, written when full
    /// or on explicit flush.
    Buffered(usize),
    /// Every frame is written immediately.
    Passthrough,
}

impl WritePolicy {
    /// `Buffered(0)` behaves exactly like `Passthrough`.
    pub fn normalized(self) -> Self {
        match self {
            WritePolicy::Buffered(0) => WritePolicy::Passthrough,
            other => other,
        }
    }
}

/// Connection configuration shared by both ends of a connection.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Write buffering policy.
    pub write_policy: WritePolicy,
    /// Largest payload accepted or produced in a single frame.
    pub max_payload_size: u32,
    /// Maximum number of live streams on this connection.
    pub max_streams: usize,
    /// Frames buffered per stream before the read loop waits on its consumer.
    pub stream_queue_capacity: usize,
    /// Outbound frames buffered before senders wait on the writer.
    pub write_queue_capacity: usize,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Keepalive ping interval (disabled when `None`).
    pub ping_interval: Option<Duration>,
    /// Close the connection after this long without inbound traffic and no
    /// live streams (disabled when `None`).
    pub idle_timeout: Option<Duration>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_streams: DEFAULT_MAX_STREAMS,
            stream_queue_capacity: DEFAULT_STREAM_QUEUE_CAPACITY,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            ping_interval: None,
            idle_timeout: None,
        }
    }
}

impl MuxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy.normalized();
        self
    }

    pub fn with_max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size.max(1);
        self
    }

    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = max.max(1);
        self
    }

    pub fn with_stream_queue_capacity(mut self, capacity: usize) -> Self {
        self.stream_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}
