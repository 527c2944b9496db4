//! Connection driver: owns the reader and writer tasks of one transport and
//! exposes stream opening, pings and shutdown.

use crate::completion::Completion;
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::framed::{FrameConnection, FrameReader, WriterStats};
use crate::mux::{ConnectionPhase, Multiplexer, Role};
use crate::stream::RpcStream;
use crate::transport::{ConnectionState, PeerAddr};
use rpcmux_protocol::{Frame, OpenRequest, ResetReason, CONTROL_STREAM_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn, Instrument};

/// How long the writer gets to flush after the read side has stopped.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stand-in deadline for a disabled idle timer.
const IDLE_DISABLED: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A multiplexed connection. Cheap to clone; every clone drives the same
/// transport.
#[derive(Clone)]
pub struct Connection {
    mux: Arc<Multiplexer>,
}

/// Streams opened by the peer, in arrival order.
#[derive(Debug)]
pub struct IncomingStreams {
    rx: mpsc::Receiver<RpcStream>,
}

impl IncomingStreams {
    /// Returns the next peer-opened stream, or `None` once the connection has
    /// closed.
    pub async fn accept(&mut self) -> Option<RpcStream> {
        self.rx.recv().await
    }
}

impl Connection {
    /// Starts the client end of a connection over an established transport.
    pub fn client(state: ConnectionState, config: MuxConfig) -> (Self, IncomingStreams) {
        Self::new(state, Role::Client, config)
    }

    /// Starts the server end of a connection over an accepted transport.
    pub fn server(state: ConnectionState, config: MuxConfig) -> (Self, IncomingStreams) {
        Self::new(state, Role::Server, config)
    }

    /// Spawns the connection's reader and writer tasks. Must be called from
    /// within a Tokio runtime.
    pub fn new(state: ConnectionState, role: Role, config: MuxConfig) -> (Self, IncomingStreams) {
        let ConnectionState {
            transport,
            id,
            peer,
            span,
        } = state;

        let (reader, writer) = FrameConnection::new(transport, &config).into_split();
        let (sink, writer_task) = writer.spawn(config.write_queue_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.max_streams.max(1));

        let mux = Arc::new(Multiplexer::new(role, config, id, peer, sink, incoming_tx));
        mux.mark_open();

        tokio::spawn(drive(mux.clone(), reader, writer_task).instrument(span));

        (Self { mux }, IncomingStreams { rx: incoming_rx })
    }

    pub fn id(&self) -> &str {
        self.mux.id()
    }

    pub fn peer(&self) -> &PeerAddr {
        self.mux.peer()
    }

    pub fn role(&self) -> Role {
        self.mux.role()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.mux.phase()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == ConnectionPhase::Closed
    }

    pub fn live_streams(&self) -> usize {
        self.mux.live_streams()
    }

    pub fn config(&self) -> &MuxConfig {
        self.mux.config()
    }

    pub fn writer_stats(&self) -> &WriterStats {
        self.mux.sink().stats()
    }

    /// Opens a stream invoking `op`.
    pub async fn open_stream(&self, op: impl Into<String>) -> Result<RpcStream, MuxError> {
        self.mux.open_stream(OpenRequest::new(op)).await
    }

    /// Opens a stream with a full open request (operation plus metadata).
    pub async fn open(&self, request: OpenRequest) -> Result<RpcStream, MuxError> {
        self.mux.open_stream(request).await
    }

    /// Measures a round trip to the peer.
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        self.mux.ping().await
    }

    /// Stops new streams, waits up to `deadline` for live ones to finish,
    /// then closes the connection. Streams still live at the deadline are
    /// reset. Returns whether every stream finished in time.
    pub async fn drain(&self, deadline: Duration) -> bool {
        self.mux.go_away().await;
        let finished = self.mux.wait_idle(Instant::now() + deadline).await;
        if !finished {
            warn!(
                remaining = self.mux.live_streams(),
                "Drain deadline passed, resetting remaining streams"
            );
        }
        self.mux.close(ResetReason::shutting_down());
        let _ = self.closed().wait().await;
        finished
    }

    /// Closes the connection now. Live streams are reset as shutting down.
    pub fn close(&self) {
        self.mux.close(ResetReason::shutting_down());
    }

    /// Closes the connection now, resetting live streams with `reason`.
    pub fn abort(&self, reason: ResetReason) {
        self.mux.close(reason);
    }

    /// Awaitable that resolves once the connection has fully closed: `Ok` for
    /// a clean close, otherwise the cause.
    pub fn closed(&self) -> Completion {
        self.mux.closed.get_or_create_task()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.mux, f)
    }
}

enum Exit {
    /// Closed from this side.
    Local,
    /// The peer closed the transport.
    PeerClosed,
}

async fn drive(
    mux: Arc<Multiplexer>,
    mut reader: FrameReader,
    writer_task: JoinHandle<Result<(), MuxError>>,
) {
    debug!(role = ?mux.role(), "Connection started");
    let mut writer_task = Some(writer_task);

    let (reason, clean) = match read_loop(&mux, &mut reader, &mut writer_task).await {
        Ok(Exit::Local) => (
            mux.cause()
                .cloned()
                .unwrap_or_else(ResetReason::shutting_down),
            true,
        ),
        Ok(Exit::PeerClosed) => (ResetReason::transport("connection closed by peer"), true),
        Err(e) => {
            warn!(error = %e, "Connection failed");
            if let MuxError::Protocol(_) = e {
                // Tell the peer why before hanging up.
                if let Ok(frame) = Frame::error(CONTROL_STREAM_ID, &e.reset_reason()) {
                    let _ = mux.sink().send(frame).await;
                }
            }
            (e.reset_reason(), false)
        }
    };

    mux.terminate(reason, clean);

    if let Some(mut task) = writer_task {
        if mux.sink().shutdown().await.is_ok() {
            match tokio::time::timeout(WRITER_SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(Err(e))) => debug!(error = %e, "Writer stopped with error"),
                Ok(_) => {}
                Err(_) => {
                    warn!("Writer did not finish in time, aborting");
                    task.abort();
                }
            }
        }
    }

    info!("Connection closed");
}

async fn read_loop(
    mux: &Arc<Multiplexer>,
    reader: &mut FrameReader,
    writer_task: &mut Option<JoinHandle<Result<(), MuxError>>>,
) -> Result<Exit, MuxError> {
    let shutdown = mux.shutdown_token();
    let idle_timeout = mux.config().idle_timeout;
    let mut keepalive = mux
        .config()
        .ping_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut unacked: Option<u64> = None;

    let idle = tokio::time::sleep(idle_timeout.unwrap_or(IDLE_DISABLED));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Ok(Exit::Local),

            result = join_writer(writer_task) => {
                result?;
                return Ok(Exit::Local);
            }

            _ = tick(&mut keepalive) => {
                if let Some(nonce) = unacked.take() {
                    if mux.take_unacked(nonce) {
                        return Err(MuxError::ConnectionClosed(ResetReason::transport(
                            "keepalive timeout",
                        )));
                    }
                }
                unacked = Some(mux.send_keepalive().await?);
            }

            _ = &mut idle, if idle_timeout.is_some() => {
                if mux.live_streams() == 0 {
                    info!("Idle timeout, closing connection");
                    mux.go_away().await;
                    return Ok(Exit::Local);
                }
                if let Some(timeout) = idle_timeout {
                    idle.as_mut().reset(Instant::now() + timeout);
                }
            }

            frame = reader.next_frame() => match frame? {
                Some(frame) => {
                    if let Some(timeout) = idle_timeout {
                        idle.as_mut().reset(Instant::now() + timeout);
                    }
                    mux.dispatch(frame).await?;
                }
                None => return Ok(Exit::PeerClosed),
            },
        }
    }
}

async fn join_writer(
    task: &mut Option<JoinHandle<Result<(), MuxError>>>,
) -> Result<(), MuxError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *task = None;
    match result {
        Ok(result) => result,
        Err(e) => Err(MuxError::ConnectionClosed(ResetReason::transport(format!(
            "writer task failed: {}",
            e
        )))),
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use crate::transport::DuplexStream;
    use bytes::Bytes;
    use rpcmux_protocol::ErrorCode;
    use tokio::io::AsyncWriteExt;

    fn pair(config: MuxConfig) -> ((Connection, IncomingStreams), (Connection, IncomingStreams)) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            Connection::client(ConnectionState::memory(a), config.clone()),
            Connection::server(ConnectionState::memory(b), config),
        )
    }

    /// Echoes every message back until the peer finishes.
    fn spawn_echo(mut incoming: IncomingStreams) {
        tokio::spawn(async move {
            while let Some(mut stream) = incoming.accept().await {
                tokio::spawn(async move {
                    while let Ok(Some(message)) = stream.recv().await {
                        if stream.send(message).await.is_err() {
                            return;
                        }
                    }
                    let _ = stream.finish().await;
                });
            }
        });
    }

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let ((client, _), (_server, incoming)) = pair(MuxConfig::new());
        spawn_echo(incoming);

        let mut stream = client.open_stream("echo").await.unwrap();
        assert_eq!(stream.id(), 1);
        stream.send(Bytes::from_static(b"one")).await.unwrap();
        stream.send_final(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(stream.recv().await.unwrap().unwrap(), "one");
        assert_eq!(stream.recv().await.unwrap().unwrap(), "two");
        assert!(stream.recv().await.unwrap().is_none());
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(client.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_stream_ids_are_odd_and_increasing() {
        let ((client, _), (_server, incoming)) = pair(MuxConfig::new());
        spawn_echo(incoming);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(client.open_stream("echo").await.unwrap().id());
        }
        assert_eq!(ids, vec![1, 3, 5, 7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_opens_reach_the_peer_in_order() {
        const OPENS: usize = 4000;
        let config = MuxConfig::new().with_max_streams(OPENS * 2);
        let ((client, _), (server, mut incoming)) = pair(config);

        let accepted = tokio::spawn(async move {
            let mut count = 0;
            while count < OPENS {
                if incoming.accept().await.is_none() {
                    break;
                }
                count += 1;
            }
            count
        });

        let opens: Vec<_> = (0..OPENS)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.open_stream("x").await })
            })
            .collect();
        let mut streams = Vec::with_capacity(OPENS);
        for open in opens {
            streams.push(open.await.unwrap().unwrap());
        }

        let accepted = tokio::time::timeout(Duration::from_secs(10), accepted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted, OPENS);
        assert_eq!(server.phase(), ConnectionPhase::Open);
        assert_eq!(client.phase(), ConnectionPhase::Open);
    }

    #[tokio::test]
    async fn test_last_stream_id_is_usable() {
        let ((client, _), (_server, mut incoming)) = pair(MuxConfig::new());
        client.mux.set_next_local_id(u32::MAX).await;

        let stream = client.open_stream("last").await.unwrap();
        assert_eq!(stream.id(), u32::MAX);
        assert_eq!(incoming.accept().await.unwrap().id(), u32::MAX);

        let err = client.open_stream("past").await.unwrap_err();
        assert!(matches!(err, MuxError::StreamIdsExhausted));
    }

    #[tokio::test]
    async fn test_server_opened_streams_use_even_ids() {
        let ((_client, client_incoming), (server, _)) = pair(MuxConfig::new());
        spawn_echo(client_incoming);

        let mut stream = server.open_stream("callback").await.unwrap();
        assert_eq!(stream.id(), 2);
        stream.send_final(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_large_payload_is_split_and_reassembled() {
        let config = MuxConfig::new().with_max_payload_size(1024);
        let ((client, _), (_server, incoming)) = pair(config);
        spawn_echo(incoming);

        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let mut stream = client.open_stream("echo").await.unwrap();
        stream.send_final(payload.clone()).await.unwrap();

        let echoed = stream.recv().await.unwrap().unwrap();
        assert_eq!(echoed.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn test_cancel_reaches_the_peer() {
        let ((client, _), (_server, mut incoming)) = pair(MuxConfig::new());

        let mut stream = client.open_stream("wait").await.unwrap();
        stream.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut accepted = incoming.accept().await.unwrap();
        let handle = accepted.handle();
        assert_eq!(accepted.recv().await.unwrap().unwrap(), "hello");

        stream.cancel();
        handle.cancellation().cancelled().await;

        let err = accepted.recv().await.unwrap_err();
        match err {
            MuxError::Reset { reason, .. } => assert_eq!(reason.code, ErrorCode::Cancelled),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(handle.state(), StreamState::Reset);
    }

    #[tokio::test]
    async fn test_dropping_all_handles_cancels() {
        let ((client, _), (_server, mut incoming)) = pair(MuxConfig::new());

        let stream = client.open_stream("wait").await.unwrap();
        let accepted = incoming.accept().await.unwrap();
        drop(stream);

        let outcome = accepted.handle().completion().wait().await;
        assert_eq!(outcome.unwrap_err().code, ErrorCode::Cancelled);
        assert_eq!(client.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_reset_isolated_to_one_stream() {
        let ((client, _), (_server, mut incoming)) = pair(MuxConfig::new());

        let mut first = client.open_stream("a").await.unwrap();
        let mut second = client.open_stream("b").await.unwrap();
        let mut server_first = incoming.accept().await.unwrap();
        let mut server_second = incoming.accept().await.unwrap();

        server_first
            .handle()
            .reset(ResetReason::new(ErrorCode::HandlerFailed, "boom"));
        let err = first.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerFailed);

        second.send_final(Bytes::from_static(b"still fine")).await.unwrap();
        assert_eq!(server_second.recv().await.unwrap().unwrap(), "still fine");
        server_second.send_final(Bytes::from_static(b"ok")).await.unwrap();
        assert_eq!(second.recv().await.unwrap().unwrap(), "ok");

        assert!(server_first.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn test_full_stream_queue_does_not_block_siblings() {
        let config = MuxConfig::new().with_stream_queue_capacity(2);
        let ((client, _), (_server, mut incoming)) = pair(config);

        // Fill the slow stream's queue without consuming it.
        let mut slow = client.open_stream("slow").await.unwrap();
        let mut server_slow = incoming.accept().await.unwrap();
        slow.send(Bytes::from_static(b"one")).await.unwrap();
        slow.send(Bytes::from_static(b"two")).await.unwrap();

        let mut fast = client.open_stream("fast").await.unwrap();
        let mut server_fast = incoming.accept().await.unwrap();
        for i in 0..10u8 {
            fast.send(Bytes::from(vec![i])).await.unwrap();
            assert_eq!(server_fast.recv().await.unwrap().unwrap(), Bytes::from(vec![i]));
        }

        assert_eq!(server_slow.recv().await.unwrap().unwrap(), "one");
        assert_eq!(server_slow.recv().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn test_stream_limit_refuses_local_and_remote_opens() {
        let config = MuxConfig::new().with_max_streams(2);
        let ((client, _), (_server, _incoming)) = pair(config);

        let _a = client.open_stream("x").await.unwrap();
        let _b = client.open_stream("y").await.unwrap();
        let err = client.open_stream("z").await.unwrap_err();
        assert!(matches!(err, MuxError::StreamLimit { max: 2 }));
    }

    #[tokio::test]
    async fn test_remote_limit_sends_refused_stream() {
        let ((client, _), (_server, _incoming)) =
            pair_with(MuxConfig::new(), MuxConfig::new().with_max_streams(1));

        let _a = client.open_stream("x").await.unwrap();
        let mut b = client.open_stream("y").await.unwrap();
        let err = b.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RefusedStream);
        assert!(err.code().is_retryable());
    }

    fn pair_with(
        client: MuxConfig,
        server: MuxConfig,
    ) -> ((Connection, IncomingStreams), (Connection, IncomingStreams)) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            Connection::client(ConnectionState::memory(a), client),
            Connection::server(ConnectionState::memory(b), server),
        )
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let ((client, _), (server, _)) = pair(MuxConfig::new());
        client.ping().await.unwrap();
        server.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_loss_resets_every_stream() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client, _) = Connection::client(ConnectionState::memory(a), MuxConfig::new());
        let mut raw = DuplexStream::pipe(b);

        let mut streams = Vec::new();
        for op in ["a", "b", "c"] {
            streams.push(client.open_stream(op).await.unwrap());
        }
        raw.close().await.unwrap();
        drop(raw);

        for stream in &mut streams {
            let err = stream.recv().await.unwrap_err();
            assert!(matches!(err, MuxError::Reset { .. }));
            assert_eq!(err.code(), ErrorCode::TransportError);
        }
        let outcome = client.closed().wait().await;
        assert_eq!(outcome.unwrap_err().code, ErrorCode::TransportError);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_protocol_violation_is_fatal() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (server, _incoming) = Connection::server(ConnectionState::memory(b), MuxConfig::new());
        let mut raw = DuplexStream::pipe(a);

        // Clients may not open even-numbered streams.
        let frame = Frame::open(2, &OpenRequest::new("x")).unwrap();
        raw.write_all(&frame.encode().unwrap()).await.unwrap();

        let outcome = server.closed().wait().await;
        assert_eq!(outcome.unwrap_err().code, ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn test_go_away_blocks_new_streams() {
        let ((client, _), (server, _incoming)) = pair(MuxConfig::new());

        let drained = tokio::spawn(async move { server.drain(Duration::from_secs(1)).await });
        assert!(drained.await.unwrap());

        let outcome = client.closed().wait().await;
        assert!(outcome.is_ok());
        assert!(client.open_stream("late").await.is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_live_streams() {
        let ((client, _), (server, mut incoming)) = pair(MuxConfig::new());

        let mut stream = client.open_stream("slow").await.unwrap();
        let mut accepted = incoming.accept().await.unwrap();

        let drain = {
            let server = server.clone();
            tokio::spawn(async move { server.drain(Duration::from_secs(5)).await })
        };

        // Draining refuses new work but the live stream completes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.phase(), ConnectionPhase::Draining);

        stream.send_final(Bytes::from_static(b"req")).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap().unwrap(), "req");
        accepted.send_final(Bytes::from_static(b"resp")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), "resp");

        assert!(drain.await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_deadline_resets_stragglers() {
        let ((client, _), (server, mut incoming)) = pair(MuxConfig::new());

        let mut stream = client.open_stream("stuck").await.unwrap();
        let accepted = incoming.accept().await.unwrap();

        assert!(!server.drain(Duration::from_millis(50)).await);
        let reason = accepted.handle().reset_reason().unwrap();
        assert_eq!(reason.code, ErrorCode::ShuttingDown);

        let err = stream.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_times_out_silent_peer() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = MuxConfig::new().with_ping_interval(Duration::from_secs(1));
        let (client, _) = Connection::client(ConnectionState::memory(a), config);
        // The peer never reads, so pings are never acknowledged.
        let _raw = b;

        let outcome = client.closed().wait().await;
        let reason = outcome.unwrap_err();
        assert_eq!(reason.code, ErrorCode::TransportError);
        assert!(reason.message.contains("keepalive"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_quiet_connection() {
        let config = MuxConfig::new().with_idle_timeout(Duration::from_secs(30));
        let ((client, _), (server, _)) = pair_with(MuxConfig::new(), config);

        assert!(server.closed().wait().await.is_ok());
        assert!(client.closed().wait().await.is_ok());
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_unknown_stream_frames_are_dropped() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        // The test runtime is single threaded, so the connection's tasks
        // log through this subscriber too.
        let _guard = tracing::subscriber::set_default(subscriber);

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (server, mut incoming) =
            Connection::server(ConnectionState::memory(b), MuxConfig::new());
        let mut raw = DuplexStream::pipe(a);

        let mut wire = Frame::data(41, Bytes::from_static(b"stray")).encode().unwrap();
        wire.extend_from_slice(&Frame::open(1, &OpenRequest::new("real")).unwrap().encode().unwrap());
        raw.write_all(&wire).await.unwrap();

        let stream = incoming.accept().await.unwrap();
        assert_eq!(stream.op(), "real");
        assert_eq!(server.phase(), ConnectionPhase::Open);

        let output = logs.contents();
        assert!(output.contains("WARN"), "{}", output);
        assert!(output.contains("Dropping frame for unknown or finished stream"));
        assert!(output.contains("stream_id=41"));
    }
}
