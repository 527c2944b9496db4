//! High-level client API.

use crate::connector::{connect, ConnectConfig};
use crate::error::ClientError;
use crate::stream::{ClientStreamingCall, ResponseStream};
use bytes::Bytes;
use rpcmux_core::{Connection, IncomingStreams, RpcStream};
use rpcmux_protocol::OpenRequest;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;

/// High-level client for rpcmux. Dropping it closes the connection.
pub struct Client {
    connection: Connection,
    incoming: Mutex<IncomingStreams>,
    call_timeout: Option<Duration>,
}

impl Client {
    /// Connects to the configured endpoint.
    pub async fn connect(config: ConnectConfig) -> Result<Self, ClientError> {
        let (connection, incoming) = connect(&config).await?;
        Ok(Self::from_connection(connection, incoming, config.call_timeout))
    }

    /// Wraps an already running client connection.
    pub fn from_connection(
        connection: Connection,
        incoming: IncomingStreams,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connection,
            incoming: Mutex::new(incoming),
            call_timeout,
        }
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    // =========================================================================
    // Call shapes
    // =========================================================================

    /// One request, one response.
    pub async fn unary(&self, op: &str, request: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        self.unary_with(OpenRequest::new(op), request).await
    }

    /// Unary call with call metadata.
    pub async fn unary_with(
        &self,
        open: OpenRequest,
        request: impl Into<Bytes>,
    ) -> Result<Bytes, ClientError> {
        let request = request.into();
        self.with_timeout(async {
            let mut stream = self.connection.open(open).await?;
            stream.send_final(request).await?;
            stream.recv().await?.ok_or(ClientError::MissingResponse)
        })
        .await
    }

    /// One request, a stream of responses.
    pub async fn server_streaming(
        &self,
        op: &str,
        request: impl Into<Bytes>,
    ) -> Result<ResponseStream, ClientError> {
        self.server_streaming_with(OpenRequest::new(op), request)
            .await
    }

    pub async fn server_streaming_with(
        &self,
        open: OpenRequest,
        request: impl Into<Bytes>,
    ) -> Result<ResponseStream, ClientError> {
        let mut stream = self.connection.open(open).await?;
        stream.send_final(request).await?;
        Ok(ResponseStream::new(stream))
    }

    /// A stream of requests, one response.
    pub async fn client_streaming(&self, op: &str) -> Result<ClientStreamingCall, ClientError> {
        Ok(ClientStreamingCall::new(
            self.connection.open_stream(op).await?,
        ))
    }

    /// Requests and responses flow independently in both directions.
    pub async fn duplex(&self, op: &str) -> Result<RpcStream, ClientError> {
        Ok(self.connection.open_stream(op).await?)
    }

    /// Next stream opened by the server, or `None` once the connection has
    /// closed.
    pub async fn accept_stream(&self) -> Option<RpcStream> {
        self.incoming.lock().await.accept().await
    }

    // =========================================================================
    // Connection operations
    // =========================================================================

    /// Measures a round trip to the server.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        self.with_timeout(async { Ok::<_, ClientError>(self.connection.ping().await?) })
            .await
    }

    /// Lets live calls finish for up to `deadline`, then closes the
    /// connection. Returns whether every call finished in time.
    pub async fn close(&self, deadline: Duration) -> bool {
        self.connection.drain(deadline).await
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match self.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => call.await,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.connection.is_closed() {
            self.connection.close();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux_core::{ConnectionState, MuxConfig};
    use rpcmux_protocol::ErrorCode;

    /// A client wired to an in-memory server connection the test drives.
    fn pair(call_timeout: Option<Duration>) -> (Client, IncomingStreams) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (connection, incoming) =
            Connection::client(ConnectionState::memory(a), MuxConfig::default());
        let (_server, server_incoming) =
            Connection::server(ConnectionState::memory(b), MuxConfig::default());
        (
            Client::from_connection(connection, incoming, call_timeout),
            server_incoming,
        )
    }

    #[tokio::test]
    async fn test_unary() {
        let (client, mut incoming) = pair(None);
        tokio::spawn(async move {
            let mut stream = incoming.accept().await.unwrap();
            assert_eq!(stream.op(), "double");
            let request = stream.recv().await.unwrap().unwrap();
            let n: u32 = std::str::from_utf8(&request).unwrap().parse().unwrap();
            stream.send_final((n * 2).to_string()).await.unwrap();
        });

        let response = client.unary("double", "21").await.unwrap();
        assert_eq!(response, Bytes::from("42"));
    }

    #[tokio::test]
    async fn test_unary_missing_response() {
        let (client, mut incoming) = pair(None);
        tokio::spawn(async move {
            let mut stream = incoming.accept().await.unwrap();
            stream.recv().await.unwrap();
            stream.finish().await.unwrap();
        });

        let err = client.unary("nothing", "x").await.unwrap_err();
        assert!(matches!(err, ClientError::MissingResponse));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unary_timeout_cancels_call() {
        let (client, mut incoming) = pair(Some(Duration::from_millis(50)));
        let server = tokio::spawn(async move {
            let mut stream = incoming.accept().await.unwrap();
            stream.recv().await.unwrap();
            // Never answers; the client gives up and cancels.
            let handle = stream.handle();
            handle.cancellation().cancelled().await;
            handle.reset_reason().unwrap()
        });

        let err = client.unary("slow", "x").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(server.await.unwrap().code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn test_server_streaming_cancel() {
        let (client, mut incoming) = pair(None);
        tokio::spawn(async move {
            let mut stream = incoming.accept().await.unwrap();
            stream.recv().await.unwrap();
            for i in 0..3 {
                if stream.send(format!("item {}", i)).await.is_err() {
                    break;
                }
            }
        });

        let mut responses = client.server_streaming("items", "").await.unwrap();
        assert_eq!(responses.next().await.unwrap().unwrap(), Bytes::from("item 0"));
        responses.cancel();
        let err = responses.next().await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Cancelled));
        assert_eq!(responses.reset_reason().unwrap().code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn test_client_streaming() {
        let (client, mut incoming) = pair(None);
        tokio::spawn(async move {
            let mut stream = incoming.accept().await.unwrap();
            let mut parts = Vec::new();
            while let Some(part) = stream.recv().await.unwrap() {
                parts.push(String::from_utf8(part.to_vec()).unwrap());
            }
            stream.send_final(parts.join("+")).await.unwrap();
        });

        let mut call = client.client_streaming("join").await.unwrap();
        call.send("a").await.unwrap();
        call.send("b").await.unwrap();
        assert_eq!(call.finish().await.unwrap(), Bytes::from("a+b"));
    }

    #[tokio::test]
    async fn test_drop_closes_connection() {
        let (client, _incoming) = pair(None);
        let connection = client.connection().clone();
        drop(client);
        let _ = connection.closed().wait().await;
        assert!(connection.is_closed());
    }
}
