//! Frame connection: turns a [`DuplexStream`] into a frame reader and a
//! policy-driven frame writer.

use crate::config::{MuxConfig, WritePolicy};
use crate::error::MuxError;
use crate::transport::DuplexStream;
use bytes::BytesMut;
use rpcmux_protocol::{Frame, FrameDecoder, FrameKind, ResetReason, CONTROL_STREAM_ID};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Under the merge policy a batch is written early once it grows past this.
const MERGE_FLUSH_THRESHOLD: usize = 256 * 1024;

/// Counters kept by a [`FrameWriter`].
#[derive(Debug, Default)]
pub struct WriterStats {
    frames: AtomicU64,
    physical_writes: AtomicU64,
    bytes: AtomicU64,
}

impl WriterStats {
    /// Frames encoded into the outbound buffer.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Writes issued to the underlying transport.
    pub fn physical_writes(&self) -> u64 {
        self.physical_writes.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// A transport that speaks frames.
pub struct FrameConnection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl FrameConnection {
    pub fn new(transport: DuplexStream, config: &MuxConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: FrameReader {
                inner: read_half,
                decoder: FrameDecoder::with_max_payload(config.max_payload_size),
                buf: vec![0u8; config.read_buffer_size],
                finished: false,
            },
            writer: FrameWriter {
                inner: write_half,
                policy: config.write_policy.normalized(),
                max_payload: config.max_payload_size,
                pending: BytesMut::with_capacity(8192),
                stats: Arc::new(WriterStats::default()),
            },
        }
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

/// Read side of a frame connection.
pub struct FrameReader {
    inner: ReadHalf<DuplexStream>,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    finished: bool,
}

impl FrameReader {
    /// Returns the next complete frame, or `None` once the peer has closed
    /// cleanly. Ending in the middle of a frame is an error. After `None` or an
    /// error the reader is finished and keeps returning `None`.
    ///
    /// Cancel safe: bytes are only consumed from the transport once a read
    /// completes, and they are buffered before the next await point.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, MuxError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            match self.decoder.decode_frame() {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Err(e.into());
                }
            }

            let n = match self.inner.read(&mut self.buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.finished = true;
                    return Err(e.into());
                }
            };

            if n == 0 {
                self.finished = true;
                self.decoder.finish()?;
                return Ok(None);
            }

            self.decoder.extend(&self.buf[..n]);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Write side of a frame connection.
pub struct FrameWriter {
    inner: WriteHalf<DuplexStream>,
    policy: WritePolicy,
    max_payload: u32,
    pending: BytesMut,
    stats: Arc<WriterStats>,
}

impl FrameWriter {
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    /// Encodes a frame and writes it out according to the policy.
    ///
    /// Under `Merge` the frame stays buffered until [`flush`](Self::flush);
    /// the writer task flushes once its queue is momentarily empty. Under
    /// `Buffered` a frame that ends a direction of a stream, or any control
    /// frame, is flushed with everything before it.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), MuxError> {
        frame.encode_to(&mut self.pending, self.max_payload)?;
        self.stats.frames.fetch_add(1, Ordering::Relaxed);

        match self.policy {
            WritePolicy::Passthrough => self.flush().await,
            WritePolicy::Buffered(limit) if self.pending.len() >= limit || ends_exchange(frame) => {
                self.flush().await
            }
            WritePolicy::Buffered(_) | WritePolicy::Merge => Ok(()),
        }
    }

    /// Writes everything buffered in one physical write.
    pub async fn flush(&mut self) -> Result<(), MuxError> {
        if !self.pending.is_empty() {
            let len = self.pending.len();
            self.inner.write_all(&self.pending).await?;
            self.pending.clear();
            self.stats.physical_writes.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes and shuts down the transport's write side.
    pub async fn shutdown(&mut self) -> Result<(), MuxError> {
        self.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Moves the writer onto its own task, fed through a bounded queue.
    pub fn spawn(self, queue_capacity: usize) -> (FrameSink, JoinHandle<Result<(), MuxError>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let sink = FrameSink {
            tx,
            stats: self.stats.clone(),
        };
        let handle = tokio::spawn(self.run(rx));
        (sink, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WriteCommand>) -> Result<(), MuxError> {
        while let Some(command) = rx.recv().await {
            if self.apply(command).await? {
                return Ok(());
            }

            if self.policy == WritePolicy::Merge {
                // Give producers woken in this turn a chance to enqueue.
                tokio::task::yield_now().await;
                while let Ok(command) = rx.try_recv() {
                    if self.apply(command).await? {
                        return Ok(());
                    }
                    if self.pending.len() >= MERGE_FLUSH_THRESHOLD {
                        self.flush().await?;
                    }
                }
                self.flush().await?;
            }
        }

        // Every sink is gone.
        self.shutdown().await
    }

    /// Applies one command. Returns `true` once the writer has shut down.
    async fn apply(&mut self, command: WriteCommand) -> Result<bool, MuxError> {
        match command {
            WriteCommand::Frame(frame) => {
                self.write_frame(&frame).await?;
                Ok(false)
            }
            WriteCommand::Flush => {
                self.flush().await?;
                Ok(false)
            }
            WriteCommand::Shutdown => {
                self.shutdown().await?;
                Ok(true)
            }
        }
    }
}

enum WriteCommand {
    Frame(Frame),
    Flush,
    Shutdown,
}

/// Cloneable handle feeding the writer task.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<WriteCommand>,
    stats: Arc<WriterStats>,
}

impl FrameSink {
    /// Queues a frame, waiting while the queue is full.
    pub async fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.tx
            .send(WriteCommand::Frame(frame))
            .await
            .map_err(|_| writer_gone())
    }

    /// Queues a frame without waiting. If the queue is full the frame is
    /// handed to a background task instead.
    pub fn send_detached(&self, frame: Frame) {
        match self.tx.try_send(WriteCommand::Frame(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                let tx = self.tx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = tx.send(command).await;
                        });
                    }
                    Err(_) => tracing::debug!("No runtime to queue frame, dropping it"),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Asks the writer to write out anything buffered.
    pub async fn flush(&self) -> Result<(), MuxError> {
        self.tx
            .send(WriteCommand::Flush)
            .await
            .map_err(|_| writer_gone())
    }

    /// Asks the writer to flush and shut down the transport. Frames queued
    /// before this call are still written.
    pub async fn shutdown(&self) -> Result<(), MuxError> {
        self.tx
            .send(WriteCommand::Shutdown)
            .await
            .map_err(|_| writer_gone())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

/// Whether the peer may be waiting on this frame before sending more.
fn ends_exchange(frame: &Frame) -> bool {
    frame.stream_id == CONTROL_STREAM_ID
        || frame.flags.is_final()
        || matches!(
            frame.kind,
            FrameKind::HalfClose | FrameKind::Close | FrameKind::Error
        )
}

fn writer_gone() -> MuxError {
    MuxError::ConnectionClosed(ResetReason::transport("connection writer closed"))
}
