//! Service registration and call dispatch.
//!
//! A [`ServiceRegistry`] maps the operation named in a stream's Open frame
//! to a [`Handler`]. Raw handlers see the stream's two halves directly and
//! cover client-streaming and duplex calls; [`ServiceRegistry::unary`] and
//! [`ServiceRegistry::server_streaming`] adapt plain async functions.

use bytes::Bytes;
use futures::FutureExt;
use rpcmux_core::{Connection, MuxError, PeerAddr, RpcStream, StreamReceiver, StreamSender};
use rpcmux_protocol::{ErrorCode, ResetReason};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    stream_id: u32,
    op: String,
    metadata: HashMap<String, String>,
    connection_id: String,
    peer: PeerAddr,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    /// Looks up one metadata entry sent with the Open frame.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn all_metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Whether the stream was reset or its connection failed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A call handed to a raw handler.
pub struct ServerCall {
    /// Messages from the caller; `None` once the caller finishes sending.
    pub input: StreamReceiver,
    /// Messages to the caller.
    pub output: StreamSender,
    pub ctx: CallContext,
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall").field("ctx", &self.ctx).finish()
    }
}

/// Failure returned by a handler. The stream is reset with its code and
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct CallError {
    pub code: ErrorCode,
    pub message: String,
}

impl CallError {
    /// A `HANDLER_FAILED` error.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::HandlerFailed, message)
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        ResetReason::cancelled().into()
    }

    pub fn reason(&self) -> ResetReason {
        ResetReason::new(self.code, self.message.clone())
    }
}

impl From<ResetReason> for CallError {
    fn from(reason: ResetReason) -> Self {
        Self::with_code(reason.code, reason.message)
    }
}

impl From<MuxError> for CallError {
    fn from(err: MuxError) -> Self {
        err.reset_reason().into()
    }
}

impl From<&str> for CallError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CallError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), CallError>> + Send + 'static>>;

/// Serves calls for one operation.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, call: ServerCall) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CallError>> + Send + 'static,
{
    fn call(&self, call: ServerCall) -> HandlerFuture {
        Box::pin(self(call))
    }
}

/// Output side of a server-streaming call.
#[derive(Debug)]
pub struct ServerStreamWriter {
    output: StreamSender,
    cancel: CancellationToken,
}

impl ServerStreamWriter {
    /// Sends one message. Fails with `CANCELLED` once the caller has gone.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<(), CallError> {
        if self.cancel.is_cancelled() {
            return Err(CallError::cancelled());
        }
        self.output.send(payload).await.map_err(CallError::from)
    }

    /// Pushes sent messages out on connections that buffer writes.
    pub async fn flush(&self) -> Result<(), CallError> {
        self.output.flush().await.map_err(CallError::from)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// How a dispatched call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Completed,
    Failed(ResetReason),
}

/// Operation name to handler map.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a raw handler, replacing any earlier one for `op`.
    pub fn register(&mut self, op: impl Into<String>, handler: impl Handler) -> &mut Self {
        let op = op.into();
        if self.handlers.insert(op.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(op = %op, "Replaced handler");
        }
        self
    }

    /// Registers a request/response handler. The first message from the
    /// caller is the request; the returned bytes go back as the final
    /// payload.
    pub fn unary<F, Fut>(&mut self, op: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Bytes, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, CallError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(op, move |call: ServerCall| {
            let f = f.clone();
            async move {
                let ServerCall {
                    mut input,
                    mut output,
                    ctx,
                } = call;
                let request = input.recv().await?.unwrap_or_default();
                let response = f(request, ctx).await?;
                output.send_final(response).await?;
                Ok::<(), CallError>(())
            }
        })
    }

    /// Registers a handler that answers one request with a sequence of
    /// messages. The output is finished when the handler returns.
    pub fn server_streaming<F, Fut>(&mut self, op: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Bytes, ServerStreamWriter, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(op, move |call: ServerCall| {
            let f = f.clone();
            async move {
                let ServerCall {
                    mut input,
                    output,
                    ctx,
                } = call;
                let request = input.recv().await?.unwrap_or_default();
                let writer = ServerStreamWriter {
                    output,
                    cancel: ctx.cancellation_token(),
                };
                f(request, writer, ctx).await
            }
        })
    }

    pub fn get(&self, op: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(op).cloned()
    }

    pub fn contains(&self, op: &str) -> bool {
        self.handlers.contains_key(op)
    }

    /// Registered operation names, sorted.
    pub fn ops(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for an accepted stream to completion and ends the
    /// stream accordingly: finished and closed on success, reset with the
    /// handler's error, `INTERNAL_ERROR` on panic, `UNKNOWN_OPERATION` when
    /// nothing is registered.
    pub async fn dispatch(&self, stream: RpcStream, connection: &Connection) -> CallOutcome {
        let handle = stream.handle();
        let stream_id = handle.id();

        let Some(handler) = self.get(stream.op()) else {
            let reason = ResetReason::new(
                ErrorCode::UnknownOperation,
                format!("no handler registered for '{}'", stream.op()),
            );
            tracing::warn!(stream_id, op = %stream.op(), "Unknown operation");
            handle.reset(reason.clone());
            return CallOutcome::Failed(reason);
        };

        let ctx = CallContext {
            stream_id,
            op: stream.op().to_string(),
            metadata: stream.metadata().clone(),
            connection_id: connection.id().to_string(),
            peer: connection.peer().clone(),
            cancel: handle.cancellation(),
        };
        tracing::debug!(stream_id, op = %ctx.op, "Dispatching call");

        let (output, input) = stream.into_split();
        let call = ServerCall { input, output, ctx };
        let result = AssertUnwindSafe(handler.call(call)).catch_unwind().await;

        let failure = match result {
            Ok(Ok(())) => {
                let finished = match handle.finish().await {
                    Ok(()) => handle.close().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = finished {
                    tracing::debug!(stream_id, error = %e, "Could not close finished call");
                }
                None
            }
            Ok(Err(e)) => {
                tracing::debug!(stream_id, error = %e, "Handler failed");
                Some(e.reason())
            }
            Err(_) => {
                tracing::error!(stream_id, op = %handle.op(), "Handler panicked");
                Some(ResetReason::new(
                    ErrorCode::InternalError,
                    "handler panicked",
                ))
            }
        };

        if let Some(reason) = failure {
            handle.reset(reason);
        }
        match handle.reset_reason() {
            Some(reason) => CallOutcome::Failed(reason),
            None => CallOutcome::Completed,
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("ops", &self.ops())
            .finish()
    }
}
