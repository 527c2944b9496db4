//! Stream multiplexer: id allocation, the live-stream table and inbound
//! frame dispatch.

use crate::completion::LazyCompletion;
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::framed::FrameSink;
use crate::stream::{Inbound, RpcStream, StreamShared, StreamState};
use crate::transport::PeerAddr;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rpcmux_protocol::{
    ErrorCode, Frame, FrameFlags, FrameKind, OpenRequest, ProtocolError, ResetReason,
    CONTROL_STREAM_ID,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Which end of the connection this is. Clients allocate odd stream ids,
/// servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` belongs to the id space this side allocates from.
    pub fn owns(self, stream_id: u32) -> bool {
        match self {
            Role::Client => stream_id % 2 == 1,
            Role::Server => stream_id != 0 && stream_id % 2 == 0,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionPhase {
    Connecting = 0,
    Open = 1,
    /// No new streams; live ones run to completion.
    Draining = 2,
    Closed = 3,
}

impl ConnectionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionPhase::Connecting,
            1 => ConnectionPhase::Open,
            2 => ConnectionPhase::Draining,
            _ => ConnectionPhase::Closed,
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Draining => "draining",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The per-connection stream table and everything that mutates it.
pub struct Multiplexer {
    role: Role,
    config: MuxConfig,
    id: String,
    peer: PeerAddr,
    sink: FrameSink,
    streams: DashMap<u32, Arc<StreamShared>>,
    /// Next id to hand out. Held across the Open enqueue so Open frames
    /// reach the wire in id order.
    next_local_id: AsyncMutex<u64>,
    last_remote_id: AtomicU32,
    phase: AtomicU8,
    shutdown: CancellationToken,
    cause: OnceLock<ResetReason>,
    incoming: Mutex<Option<mpsc::Sender<RpcStream>>>,
    stream_removed: Notify,
    pub(crate) closed: LazyCompletion,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_ping: AtomicU64,
}

impl Multiplexer {
    pub(crate) fn new(
        role: Role,
        config: MuxConfig,
        id: String,
        peer: PeerAddr,
        sink: FrameSink,
        incoming: mpsc::Sender<RpcStream>,
    ) -> Self {
        Self {
            role,
            next_local_id: AsyncMutex::new(u64::from(role.first_stream_id())),
            config,
            id,
            peer,
            sink,
            streams: DashMap::new(),
            last_remote_id: AtomicU32::new(0),
            phase: AtomicU8::new(ConnectionPhase::Connecting as u8),
            shutdown: CancellationToken::new(),
            cause: OnceLock::new(),
            incoming: Mutex::new(Some(incoming)),
            stream_removed: Notify::new(),
            closed: LazyCompletion::new(),
            pings: Mutex::new(HashMap::new()),
            next_ping: AtomicU64::new(1),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The reason the connection ended (or is ending), if known.
    pub fn cause(&self) -> Option<&ResetReason> {
        self.cause.get()
    }

    #[cfg(test)]
    pub(crate) async fn set_next_local_id(&self, id: u32) {
        *self.next_local_id.lock().await = u64::from(id);
    }

    pub(crate) fn mark_open(&self) {
        self.transition(ConnectionPhase::Connecting, ConnectionPhase::Open);
    }

    fn transition(&self, from: ConnectionPhase, to: ConnectionPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn closed_error(&self) -> MuxError {
        MuxError::ConnectionClosed(
            self.cause
                .get()
                .cloned()
                .unwrap_or_else(|| ResetReason::transport("connection closed")),
        )
    }

    // --- streams opened by this side ---

    /// Opens a stream for `request`. Fails with [`MuxError::StreamLimit`] when
    /// the connection already carries its maximum number of live streams.
    pub(crate) async fn open_stream(
        self: &Arc<Self>,
        request: OpenRequest,
    ) -> Result<RpcStream, MuxError> {
        match self.phase() {
            ConnectionPhase::Open => {}
            ConnectionPhase::Connecting | ConnectionPhase::Draining => {
                return Err(MuxError::Draining)
            }
            ConnectionPhase::Closed => return Err(self.closed_error()),
        }

        let max = self.config.max_streams;
        if self.streams.len() >= max {
            return Err(MuxError::StreamLimit { max });
        }

        let mut next_id = self.next_local_id.lock().await;
        let id = u32::try_from(*next_id).map_err(|_| MuxError::StreamIdsExhausted)?;
        let frame = Frame::open(id, &request)?;
        *next_id += 2;
        let (tx, rx) = mpsc::channel(self.config.stream_queue_capacity);
        let shared = Arc::new(StreamShared::new(
            id,
            request,
            true,
            tx,
            self.shutdown.child_token(),
        ));
        shared.advance_send(FrameKind::Open, frame.flags, "open")?;
        self.streams.insert(id, shared.clone());
        let stream = RpcStream::new(shared.clone(), self.clone(), rx);

        if let Err(e) = self.sink.send(frame).await {
            self.reset_stream(&shared, e.reset_reason(), false);
            return Err(self.closed_error());
        }
        drop(next_id);

        debug!(stream_id = id, op = %shared.request.op, "Opened stream");
        Ok(stream)
    }

    pub(crate) async fn send_payload(
        &self,
        shared: &StreamShared,
        mut payload: Bytes,
        final_payload: bool,
    ) -> Result<(), MuxError> {
        let max = self.config.max_payload_size as usize;
        while payload.len() > max {
            let chunk = payload.split_to(max);
            self.send_data(shared, FrameFlags::new().with_continued(), chunk)
                .await?;
        }

        let flags = if final_payload {
            FrameFlags::new().with_final()
        } else {
            FrameFlags::new()
        };
        self.send_data(shared, flags, payload).await
    }

    async fn send_data(
        &self,
        shared: &StreamShared,
        flags: FrameFlags,
        payload: Bytes,
    ) -> Result<(), MuxError> {
        let next = shared.advance_send(FrameKind::Data, flags, "send")?;
        self.sink
            .send(Frame::new(shared.id, FrameKind::Data, flags, payload))
            .await
            .map_err(|_| self.closed_error())?;
        if next == StreamState::Closed {
            self.retire(shared);
        }
        Ok(())
    }

    pub(crate) async fn send_half_close(&self, shared: &StreamShared) -> Result<(), MuxError> {
        let next = shared.advance_send(FrameKind::HalfClose, FrameFlags::new(), "finish")?;
        self.sink
            .send(Frame::half_close(shared.id))
            .await
            .map_err(|_| self.closed_error())?;
        if next == StreamState::Closed {
            self.retire(shared);
        }
        Ok(())
    }

    pub(crate) async fn send_close(&self, shared: &StreamShared) -> Result<(), MuxError> {
        shared.advance_send(FrameKind::Close, FrameFlags::new(), "close")?;
        self.retire(shared);
        self.sink
            .send(Frame::close(shared.id))
            .await
            .map_err(|_| self.closed_error())
    }

    pub(crate) async fn flush(&self) -> Result<(), MuxError> {
        self.sink.flush().await.map_err(|_| self.closed_error())
    }

    /// Removes a stream that closed normally.
    fn retire(&self, shared: &StreamShared) {
        self.streams.remove(&shared.id);
        shared.close_inbound();
        shared.completion.mark_complete();
        self.stream_removed.notify_waiters();
        trace!(stream_id = shared.id, "Stream closed");
    }

    /// Resets a live stream. Queued payloads are discarded, the stream's
    /// cancellation token fires and, if `notify_peer`, an Error frame goes
    /// out. Returns `false` if the stream had already ended.
    pub(crate) fn reset_stream(
        &self,
        shared: &StreamShared,
        reason: ResetReason,
        notify_peer: bool,
    ) -> bool {
        if !shared.mark_reset(reason.clone()) {
            return false;
        }

        self.streams.remove(&shared.id);
        shared.completion.complete(Err(reason.clone()));
        self.stream_removed.notify_waiters();

        debug!(
            stream_id = shared.id,
            code = %reason.code,
            "Stream reset: {}",
            reason.message
        );

        if notify_peer {
            match Frame::error(shared.id, &reason) {
                Ok(frame) => self.sink.send_detached(frame),
                Err(e) => warn!(stream_id = shared.id, error = %e, "Failed to encode reset"),
            }
        }
        true
    }

    // --- inbound ---

    /// Routes one inbound frame. An `Err` is fatal to the connection.
    pub(crate) async fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        if frame.stream_id == CONTROL_STREAM_ID {
            return self.dispatch_control(frame).await;
        }

        let existing = self
            .streams
            .get(&frame.stream_id)
            .map(|entry| entry.value().clone());

        match existing {
            Some(_) if frame.kind == FrameKind::Open => {
                Err(ProtocolError::StreamIdViolation(format!(
                    "stream {} is already open",
                    frame.stream_id
                ))
                .into())
            }
            Some(shared) => {
                self.dispatch_stream(&shared, frame).await;
                Ok(())
            }
            None if frame.kind == FrameKind::Open => self.accept_remote(frame),
            None => {
                warn!(
                    stream_id = frame.stream_id,
                    kind = frame.kind.as_str(),
                    "Dropping frame for unknown or finished stream"
                );
                Ok(())
            }
        }
    }

    async fn dispatch_control(&self, frame: Frame) -> Result<(), MuxError> {
        match frame.kind {
            FrameKind::Ping if frame.flags.is_ack() => {
                if let Some(nonce) = frame.ping_nonce() {
                    if let Some(waiter) = self.pings.lock().remove(&nonce) {
                        let _ = waiter.send(());
                    }
                }
                Ok(())
            }
            FrameKind::Ping => self
                .sink
                .send(Frame::pong(&frame))
                .await
                .map_err(|_| self.closed_error()),
            FrameKind::Close => {
                if self.transition(ConnectionPhase::Open, ConnectionPhase::Draining) {
                    info!("Peer is going away, no new streams");
                }
                Ok(())
            }
            FrameKind::Error => {
                let reason = frame
                    .reset_reason()
                    .unwrap_or_else(|e| ResetReason::protocol(e.to_string()));
                warn!(code = %reason.code, "Peer closed the connection: {}", reason.message);
                Err(MuxError::ConnectionClosed(reason))
            }
            kind => Err(ProtocolError::InvalidStreamId {
                kind: kind.as_str(),
                stream_id: CONTROL_STREAM_ID,
            }
            .into()),
        }
    }

    async fn dispatch_stream(&self, shared: &Arc<StreamShared>, frame: Frame) {
        if frame.kind == FrameKind::Error {
            let reason = frame
                .reset_reason()
                .unwrap_or_else(|e| ResetReason::protocol(e.to_string()));
            self.reset_stream(shared, reason, false);
            return;
        }

        let next = match shared.advance_recv(frame.kind, frame.flags) {
            Ok(next) => next,
            Err(state) if state.is_terminal() => {
                warn!(
                    stream_id = shared.id,
                    kind = frame.kind.as_str(),
                    "Dropping frame for finished stream"
                );
                return;
            }
            Err(state) => {
                warn!(
                    stream_id = shared.id,
                    kind = frame.kind.as_str(),
                    %state,
                    "Frame not allowed in stream state, resetting stream"
                );
                let reason = ResetReason::protocol(format!(
                    "{} frame not allowed while {}",
                    frame.kind.as_str(),
                    state
                ));
                self.reset_stream(shared, reason, true);
                return;
            }
        };

        if frame.kind == FrameKind::Data {
            let item = Inbound {
                continued: frame.flags.is_continued(),
                payload: frame.payload,
            };
            self.deliver(shared, item).await;
        }

        match next {
            StreamState::HalfClosedRemote => shared.close_inbound(),
            StreamState::Closed => self.retire(shared),
            _ => {}
        }
    }

    /// Hands a payload to the stream's consumer. When the stream queue is
    /// full the read loop waits here until there is room or the stream ends.
    async fn deliver(&self, shared: &StreamShared, item: Inbound) {
        let Some(tx) = shared.inbound_sender() else {
            return;
        };

        match tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                debug!(stream_id = shared.id, "Stream queue full, waiting on consumer");
                tokio::select! {
                    _ = tx.send(item) => {}
                    _ = shared.cancel.cancelled() => {}
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(stream_id = shared.id, "Consumer gone, dropping payload");
            }
        }
    }

    fn accept_remote(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        let id = frame.stream_id;
        if self.role.owns(id) {
            return Err(ProtocolError::StreamIdViolation(format!(
                "peer opened stream {} from this side's id space",
                id
            ))
            .into());
        }

        let previous = self.last_remote_id.fetch_max(id, Ordering::AcqRel);
        if id <= previous {
            return Err(ProtocolError::StreamIdViolation(format!(
                "stream {} is not above last opened id {}",
                id, previous
            ))
            .into());
        }

        let request = match frame.open_request() {
            Ok(request) => request,
            Err(e) => {
                warn!(stream_id = id, error = %e, "Malformed open request");
                self.refuse(id, ResetReason::protocol(e.to_string()));
                return Ok(());
            }
        };

        if self.phase() != ConnectionPhase::Open {
            self.refuse(id, ResetReason::shutting_down());
            return Ok(());
        }

        let max = self.config.max_streams;
        if self.streams.len() >= max {
            self.refuse(
                id,
                ResetReason::new(
                    ErrorCode::RefusedStream,
                    format!("stream limit reached ({} in flight)", max),
                ),
            );
            return Ok(());
        }

        let Some(incoming) = self.incoming.lock().clone() else {
            self.refuse(
                id,
                ResetReason::new(ErrorCode::RefusedStream, "not accepting streams"),
            );
            return Ok(());
        };

        let (tx, rx) = mpsc::channel(self.config.stream_queue_capacity);
        let shared = Arc::new(StreamShared::new(
            id,
            request,
            false,
            tx,
            self.shutdown.child_token(),
        ));
        if shared.advance_recv(FrameKind::Open, frame.flags) == Ok(StreamState::HalfClosedRemote) {
            shared.close_inbound();
        }
        self.streams.insert(id, shared.clone());

        let stream = RpcStream::new(shared.clone(), self.clone(), rx);
        if let Err(rejected) = incoming.try_send(stream) {
            self.reset_stream(
                &shared,
                ResetReason::new(ErrorCode::RefusedStream, "not accepting streams"),
                true,
            );
            // Dropped only after the reset so the refusal is what the peer sees.
            drop(rejected);
            return Ok(());
        }

        debug!(stream_id = id, op = %shared.request.op, "Accepted stream");
        Ok(())
    }

    fn refuse(&self, stream_id: u32, reason: ResetReason) {
        debug!(stream_id, code = %reason.code, "Refusing stream: {}", reason.message);
        match Frame::error(stream_id, &reason) {
            Ok(frame) => self.sink.send_detached(frame),
            Err(e) => warn!(stream_id, error = %e, "Failed to encode refusal"),
        }
    }

    // --- connection control ---

    /// Round-trips a Ping and returns the elapsed time.
    pub(crate) async fn ping(&self) -> Result<Duration, MuxError> {
        if self.phase() == ConnectionPhase::Closed {
            return Err(self.closed_error());
        }

        let nonce = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(nonce, tx);

        let started = Instant::now();
        if self.sink.send(Frame::ping(nonce)).await.is_err() {
            self.pings.lock().remove(&nonce);
            return Err(self.closed_error());
        }

        rx.await.map_err(|_| self.closed_error())?;
        Ok(started.elapsed())
    }

    /// Sends a keepalive Ping and returns its nonce.
    pub(crate) async fn send_keepalive(&self) -> Result<u64, MuxError> {
        let nonce = self.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, _rx) = oneshot::channel();
        self.pings.lock().insert(nonce, tx);
        self.sink
            .send(Frame::ping(nonce))
            .await
            .map_err(|_| self.closed_error())?;
        trace!(nonce, "Sent keepalive ping");
        Ok(nonce)
    }

    /// Returns `true` (and forgets it) if the Ping has not been acknowledged.
    pub(crate) fn take_unacked(&self, nonce: u64) -> bool {
        self.pings.lock().remove(&nonce).is_some()
    }

    /// Stops accepting new streams and tells the peer to stop opening them.
    pub(crate) async fn go_away(&self) -> bool {
        if !self.transition(ConnectionPhase::Open, ConnectionPhase::Draining) {
            return false;
        }
        info!(live_streams = self.streams.len(), "Draining connection");
        if self.sink.send(Frame::go_away()).await.is_err() {
            debug!("Connection writer already closed");
        }
        true
    }

    /// Waits until no streams are live or `deadline` passes. Returns whether
    /// the table emptied.
    pub(crate) async fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.stream_removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.streams.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.streams.is_empty();
            }
        }
    }

    /// Asks the connection driver to stop. Live streams are reset with
    /// `reason`; the peer is told why if any were live.
    pub(crate) fn close(&self, reason: ResetReason) {
        if self.phase() == ConnectionPhase::Closed {
            return;
        }
        let _ = self.cause.set(reason.clone());
        if !self.streams.is_empty() {
            if let Ok(frame) = Frame::error(CONTROL_STREAM_ID, &reason) {
                self.sink.send_detached(frame);
            }
        }
        self.shutdown.cancel();
    }

    /// Final teardown, run once by the connection driver. Every live stream is
    /// reset with `reason` and the connection's completion resolves.
    pub(crate) fn terminate(&self, reason: ResetReason, clean: bool) {
        let _ = self.cause.set(reason.clone());
        self.phase
            .store(ConnectionPhase::Closed as u8, Ordering::Release);
        self.incoming.lock().take();

        let live: Vec<Arc<StreamShared>> = self
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let interrupted = live.len();
        for shared in live {
            self.reset_stream(&shared, reason.clone(), false);
        }

        self.shutdown.cancel();
        self.pings.lock().clear();

        if interrupted > 0 {
            warn!(
                streams = interrupted,
                code = %reason.code,
                "Connection ended with live streams: {}",
                reason.message
            );
        }

        let outcome = if clean && interrupted == 0 {
            Ok(())
        } else {
            Err(reason)
        };
        self.closed.complete(outcome);
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("phase", &self.phase())
            .field("live_streams", &self.streams.len())
            .finish()
    }
}
