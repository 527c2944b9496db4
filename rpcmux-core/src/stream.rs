//! Streams: per-stream state machine and the user-facing handles.
//!
//! A stream is one logical bidirectional channel on a connection. Its state
//! follows the frames sent and received on it:
//!
//! ```text
//!            Open (send/recv)
//!   Idle ----------------------> Open
//!                                 |  local FINAL / HalfClose -> HalfClosedLocal
//!                                 |  remote FINAL / HalfClose -> HalfClosedRemote
//!   HalfClosed* -- other half ends --> Closed
//!   any live state -- Close --> Closed
//!   any live state -- Error --> Reset
//! ```
//!
//! `Closed` and `Reset` are terminal. Once a stream is reset no further
//! payloads are delivered to its consumer.

use crate::completion::{Completion, LazyCompletion};
use crate::error::MuxError;
use crate::mux::Multiplexer;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rpcmux_protocol::{FrameFlags, FrameKind, OpenRequest, ResetReason};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// This side has finished sending.
    HalfClosedLocal,
    /// The peer has finished sending.
    HalfClosedRemote,
    Closed,
    Reset,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }

    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_recv(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// State after sending a frame of `kind`, or `None` if the frame may not
    /// be sent in this state.
    pub fn on_send(self, kind: FrameKind, flags: FrameFlags) -> Option<StreamState> {
        self.advance(
            kind,
            flags,
            StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote,
        )
    }

    /// State after receiving a frame of `kind`, or `None` if the peer was not
    /// allowed to send it.
    pub fn on_recv(self, kind: FrameKind, flags: FrameFlags) -> Option<StreamState> {
        self.advance(
            kind,
            flags,
            StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal,
        )
    }

    /// `ours` is the half-closed state reached when the acting side ends its
    /// half; `theirs` is the one where only the other side has ended.
    fn advance(
        self,
        kind: FrameKind,
        flags: FrameFlags,
        ours: StreamState,
        theirs: StreamState,
    ) -> Option<StreamState> {
        use StreamState::*;

        let ends_half = match kind {
            FrameKind::HalfClose => true,
            FrameKind::Open | FrameKind::Data => flags.is_final(),
            _ => false,
        };

        match (self, kind) {
            (Closed | Reset, _) => None,
            (_, FrameKind::Ping) => None,
            (Idle, FrameKind::Open) => Some(if ends_half { ours } else { Open }),
            (Idle, FrameKind::Error) => Some(Reset),
            (Idle, _) => None,
            (_, FrameKind::Open) => None,
            (_, FrameKind::Error) => Some(Reset),
            (_, FrameKind::Close) => Some(Closed),
            (Open, FrameKind::Data | FrameKind::HalfClose) => {
                Some(if ends_half { ours } else { Open })
            }
            (state, FrameKind::Data | FrameKind::HalfClose) if state == theirs => {
                Some(if ends_half { Closed } else { theirs })
            }
            _ => None,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Open => "open",
            StreamState::HalfClosedLocal => "half-closed (local)",
            StreamState::HalfClosedRemote => "half-closed (remote)",
            StreamState::Closed => "closed",
            StreamState::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// One inbound Data frame queued for the consumer.
pub(crate) struct Inbound {
    pub payload: Bytes,
    pub continued: bool,
}

/// State shared between the multiplexer's table entry and the user handles.
pub(crate) struct StreamShared {
    pub id: u32,
    pub request: OpenRequest,
    pub local: bool,
    state: Mutex<StreamState>,
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
    reset: OnceLock<ResetReason>,
    pub cancel: CancellationToken,
    pub completion: LazyCompletion,
    handles: AtomicUsize,
}

impl StreamShared {
    pub fn new(
        id: u32,
        request: OpenRequest,
        local: bool,
        inbound: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            request,
            local,
            state: Mutex::new(StreamState::Idle),
            inbound: Mutex::new(Some(inbound)),
            reset: OnceLock::new(),
            cancel,
            completion: LazyCompletion::new(),
            handles: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// Applies a local send. On success returns the new state.
    pub fn advance_send(
        &self,
        kind: FrameKind,
        flags: FrameFlags,
        action: &'static str,
    ) -> Result<StreamState, MuxError> {
        let mut state = self.state.lock();
        match state.on_send(kind, flags) {
            Some(next) => {
                *state = next;
                Ok(next)
            }
            None => Err(self.rejected(*state, action)),
        }
    }

    /// Applies a received frame. `Err` carries the state that rejected it.
    pub fn advance_recv(
        &self,
        kind: FrameKind,
        flags: FrameFlags,
    ) -> Result<StreamState, StreamState> {
        let mut state = self.state.lock();
        match state.on_recv(kind, flags) {
            Some(next) => {
                *state = next;
                Ok(next)
            }
            None => Err(*state),
        }
    }

    /// Moves the stream to `Reset` and records the reason. Returns `false`
    /// if the stream had already ended.
    pub fn mark_reset(&self, reason: ResetReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return false;
            }
            *state = StreamState::Reset;
        }
        let _ = self.reset.set(reason);
        // Reason first, then close the queue: the consumer checks the reason
        // whenever the queue yields or ends.
        self.close_inbound();
        self.cancel.cancel();
        true
    }

    pub fn reset_reason(&self) -> Option<&ResetReason> {
        self.reset.get()
    }

    pub fn inbound_sender(&self) -> Option<mpsc::Sender<Inbound>> {
        self.inbound.lock().clone()
    }

    pub fn close_inbound(&self) {
        self.inbound.lock().take();
    }

    fn rejected(&self, state: StreamState, action: &'static str) -> MuxError {
        match self.reset.get() {
            Some(reason) => MuxError::Reset {
                stream_id: self.id,
                reason: reason.clone(),
            },
            None => MuxError::InvalidState {
                stream_id: self.id,
                action,
                state,
            },
        }
    }
}

/// A counted reference to a stream. When the last handle of a stream that
/// has not ended is dropped, the stream is cancelled.
pub struct StreamHandle {
    shared: Arc<StreamShared>,
    mux: Arc<Multiplexer>,
}

impl StreamHandle {
    pub(crate) fn new(shared: Arc<StreamShared>, mux: Arc<Multiplexer>) -> Self {
        shared.handles.fetch_add(1, Ordering::AcqRel);
        Self { shared, mux }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn op(&self) -> &str {
        &self.shared.request.op
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.shared.request.metadata
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Whether this side opened the stream.
    pub fn is_local(&self) -> bool {
        self.shared.local
    }

    /// Why the stream was reset, if it was.
    pub fn reset_reason(&self) -> Option<ResetReason> {
        self.shared.reset_reason().cloned()
    }

    /// Token cancelled when the stream is reset or its connection fails.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Awaitable resolving once the stream is closed or reset.
    pub fn completion(&self) -> Completion {
        self.shared.completion.get_or_create_task()
    }

    /// Ends the local half if it is still open.
    pub async fn finish(&self) -> Result<(), MuxError> {
        if !self.state().can_send() {
            return Ok(());
        }
        self.mux.send_half_close(&self.shared).await
    }

    /// Closes both directions. The peer stops sending; frames already in
    /// flight from it are dropped.
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.mux.send_close(&self.shared).await
    }

    /// Resets the stream and tells the peer why.
    pub fn reset(&self, reason: ResetReason) -> bool {
        self.mux.reset_stream(&self.shared, reason, true)
    }

    pub fn cancel(&self) -> bool {
        self.reset(ResetReason::cancelled())
    }
}

impl Clone for StreamHandle {
    fn clone(&self) -> Self {
        Self::new(self.shared.clone(), self.mux.clone())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.shared.state().is_terminal()
        {
            tracing::debug!(stream_id = self.shared.id, "Last handle dropped, cancelling stream");
            self.mux
                .reset_stream(&self.shared, ResetReason::cancelled(), true);
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.shared.id)
            .field("op", &self.shared.request.op)
            .field("state", &self.state())
            .finish()
    }
}

/// A bidirectional stream, usable whole or split into its two halves.
pub struct RpcStream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl RpcStream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        mux: Arc<Multiplexer>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        Self {
            sender: StreamSender {
                handle: StreamHandle::new(shared.clone(), mux.clone()),
            },
            receiver: StreamReceiver {
                handle: StreamHandle::new(shared, mux),
                inbound,
                partial: BytesMut::new(),
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.sender.handle.id()
    }

    pub fn op(&self) -> &str {
        self.sender.handle.op()
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        self.sender.handle.metadata()
    }

    pub fn state(&self) -> StreamState {
        self.sender.handle.state()
    }

    /// Another counted handle to the same stream.
    pub fn handle(&self) -> StreamHandle {
        self.sender.handle.clone()
    }

    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<(), MuxError> {
        self.sender.send(payload).await
    }

    pub async fn send_final(&mut self, payload: impl Into<Bytes>) -> Result<(), MuxError> {
        self.sender.send_final(payload).await
    }

    pub async fn finish(&mut self) -> Result<(), MuxError> {
        self.sender.finish().await
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, MuxError> {
        self.receiver.recv().await
    }

    pub fn cancel(&mut self) {
        self.sender.cancel();
    }

    pub fn into_split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

impl fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RpcStream").field(&self.sender.handle).finish()
    }
}

/// Sending half of a stream.
#[derive(Debug)]
pub struct StreamSender {
    handle: StreamHandle,
}

impl StreamSender {
    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Sends one message. Payloads larger than the connection's frame limit
    /// are split across continuation frames and reassembled by the peer.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<(), MuxError> {
        self.handle
            .mux
            .send_payload(&self.handle.shared, payload.into(), false)
            .await
    }

    /// Sends the last message of this half and ends it.
    pub async fn send_final(&mut self, payload: impl Into<Bytes>) -> Result<(), MuxError> {
        self.handle
            .mux
            .send_payload(&self.handle.shared, payload.into(), true)
            .await
    }

    /// Ends this half without a payload.
    pub async fn finish(&mut self) -> Result<(), MuxError> {
        self.handle.mux.send_half_close(&self.handle.shared).await
    }

    /// Resets the stream as cancelled.
    pub fn cancel(&mut self) {
        self.handle.cancel();
    }

    pub fn reset(&mut self, reason: ResetReason) {
        self.handle.reset(reason);
    }

    /// Pushes buffered frames to the transport regardless of write policy.
    pub async fn flush(&self) -> Result<(), MuxError> {
        self.handle.mux.flush().await
    }

    /// Resolves once the stream is cancelled or its connection fails.
    pub async fn cancelled(&self) {
        self.handle.shared.cancel.cancelled().await
    }
}

/// Receiving half of a stream.
pub struct StreamReceiver {
    handle: StreamHandle,
    inbound: mpsc::Receiver<Inbound>,
    partial: BytesMut,
}

impl StreamReceiver {
    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    /// Returns the next message, or `None` once the peer has finished
    /// sending. Fails with [`MuxError::Reset`] once the stream is reset, even
    /// if earlier messages were still queued.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, MuxError> {
        loop {
            self.check_reset()?;

            match self.inbound.recv().await {
                Some(item) => {
                    self.check_reset()?;
                    if item.continued {
                        self.partial.extend_from_slice(&item.payload);
                        continue;
                    }
                    if self.partial.is_empty() {
                        return Ok(Some(item.payload));
                    }
                    self.partial.extend_from_slice(&item.payload);
                    return Ok(Some(self.partial.split().freeze()));
                }
                None => {
                    self.check_reset()?;
                    if !self.partial.is_empty() {
                        let reason = ResetReason::protocol("stream ended inside a message");
                        self.handle.reset(reason.clone());
                        return Err(MuxError::Reset {
                            stream_id: self.id(),
                            reason,
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Collects every remaining message.
    pub async fn collect(&mut self) -> Result<Vec<Bytes>, MuxError> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn check_reset(&self) -> Result<(), MuxError> {
        match self.handle.shared.reset_reason() {
            Some(reason) => Err(MuxError::Reset {
                stream_id: self.handle.shared.id,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("handle", &self.handle)
            .field("partial", &self.partial.len())
            .finish()
    }
}
