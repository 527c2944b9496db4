//! Handles for calls that outlive a single request/response exchange.

use crate::error::ClientError;
use bytes::Bytes;
use rpcmux_core::{RpcStream, StreamReceiver};
use rpcmux_protocol::ResetReason;

/// Responses of a server-streaming call. Dropping it cancels the call.
#[derive(Debug)]
pub struct ResponseStream {
    receiver: StreamReceiver,
}

impl ResponseStream {
    pub(crate) fn new(stream: RpcStream) -> Self {
        let (_, receiver) = stream.into_split();
        Self { receiver }
    }

    pub fn id(&self) -> u32 {
        self.receiver.id()
    }

    /// Next response, or `None` once the server has finished.
    pub async fn next(&mut self) -> Result<Option<Bytes>, ClientError> {
        Ok(self.receiver.recv().await?)
    }

    /// Every remaining response.
    pub async fn collect(mut self) -> Result<Vec<Bytes>, ClientError> {
        Ok(self.receiver.collect().await?)
    }

    /// Cancels the call. Later reads fail with `CANCELLED`; the server's
    /// handler observes the cancellation.
    pub fn cancel(&self) {
        self.receiver.handle().cancel();
    }

    pub fn reset_reason(&self) -> Option<ResetReason> {
        self.receiver.handle().reset_reason()
    }
}

/// A client-streaming call: many requests, one response.
#[derive(Debug)]
pub struct ClientStreamingCall {
    stream: RpcStream,
}

impl ClientStreamingCall {
    pub(crate) fn new(stream: RpcStream) -> Self {
        Self { stream }
    }

    pub fn id(&self) -> u32 {
        self.stream.id()
    }

    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        Ok(self.stream.send(payload).await?)
    }

    /// Ends the request side and waits for the response.
    pub async fn finish(mut self) -> Result<Bytes, ClientError> {
        self.stream.finish().await?;
        self.stream
            .recv()
            .await?
            .ok_or(ClientError::MissingResponse)
    }

    pub fn cancel(mut self) {
        self.stream.cancel();
    }
}
