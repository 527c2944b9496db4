//! Multi-listener server: accept, dispatch, graceful shutdown.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{CallOutcome, ServiceRegistry};
use crate::listener::{BoundListener, ListenAddr};
use dashmap::DashMap;
use parking_lot::Mutex;
use rpcmux_core::{Connection, ConnectionState};
use rpcmux_protocol::ErrorCode;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Pause after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub streams_total: AtomicU64,
    pub streams_reset: AtomicU64,
    pub handler_errors: AtomicU64,
    pub errors_total: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            streams_total: self.streams_total.load(Ordering::Relaxed),
            streams_reset: self.streams_reset.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub streams_total: u64,
    pub streams_reset: u64,
    pub handler_errors: u64,
    pub errors_total: u64,
}

/// State shared by the accept loops and connection tasks.
struct Shared {
    registry: Arc<ServiceRegistry>,
    connections: DashMap<String, Connection>,
    stats: ServerStats,
    max_connections: u64,
    shutdown: CancellationToken,
    /// One task per accepted connection.
    tasks: TaskTracker,
}

/// rpcmux server.
pub struct Server {
    config: Config,
    shared: Arc<Shared>,
    listeners: Mutex<Vec<Arc<BoundListener>>>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: Config, registry: ServiceRegistry) -> Self {
        let shared = Arc::new(Shared {
            registry: Arc::new(registry),
            connections: DashMap::new(),
            stats: ServerStats::default(),
            max_connections: config.connection.max_connections as u64,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        Self {
            config,
            shared,
            listeners: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.shared.registry
    }

    /// Validates the configuration and binds every listener. Called by
    /// [`Server::run`] when needed; call it first to learn the bound
    /// addresses (e.g. with port 0).
    pub async fn bind(&self) -> Result<Vec<ListenAddr>, ServerError> {
        self.config.validate()?;

        let mut bound = Vec::with_capacity(self.config.listeners.len());
        for listener in self.config.listeners.iter() {
            let mux = self.config.mux_config(listener);
            bound.push(Arc::new(BoundListener::bind(listener, mux).await?));
        }

        let addrs = bound
            .iter()
            .map(|l| l.local_addr())
            .collect::<Result<Vec<_>, _>>()?;
        *self.listeners.lock() = bound;
        Ok(addrs)
    }

    /// Addresses of the bound listeners, in configuration order.
    pub fn local_addrs(&self) -> Vec<ListenAddr> {
        self.listeners
            .lock()
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Address of the named listener.
    pub fn local_addr(&self, name: &str) -> Option<ListenAddr> {
        self.listeners
            .lock()
            .iter()
            .find(|l| l.name() == name)
            .and_then(|l| l.local_addr().ok())
    }

    /// Runs the server until [`Server::shutdown`] is called, then drains
    /// live connections.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<(), ServerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }
        if self.listeners.lock().is_empty() {
            self.bind().await?;
        }

        let listeners = self.listeners.lock().clone();
        let mut accept_loops = JoinSet::new();
        for listener in listeners {
            accept_loops.spawn(accept_loop(listener, self.shared.clone()));
        }
        tracing::info!(
            listeners = accept_loops.len(),
            ops = self.shared.registry.len(),
            "Server started"
        );

        self.shared.shutdown.cancelled().await;
        tracing::info!("Server shutting down");

        accept_loops.shutdown().await;
        self.drain_connections().await;
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.listeners.lock().clear();

        tracing::info!(stats = ?self.shared.stats.snapshot(), "Server stopped");
        Ok(())
    }

    /// Drains every live connection in parallel, each bounded by the
    /// configured deadline.
    async fn drain_connections(&self) {
        let deadline = self.config.shutdown.drain_deadline();
        let connections: Vec<Connection> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if connections.is_empty() {
            return;
        }

        tracing::info!(
            connections = connections.len(),
            deadline_secs = deadline.as_secs_f64(),
            "Draining connections"
        );
        let mut drains = JoinSet::new();
        for connection in connections {
            drains.spawn(async move { connection.drain(deadline).await });
        }

        let mut forced = 0usize;
        while let Some(result) = drains.join_next().await {
            if !matches!(result, Ok(true)) {
                forced += 1;
            }
        }
        if forced > 0 {
            tracing::warn!(connections = forced, "Connections force-closed at drain deadline");
        }
    }

    /// Signals the server to stop accepting and drain.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listeners", &self.local_addrs())
            .field("ops", &self.shared.registry.ops())
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(listener: Arc<BoundListener>, shared: Arc<Shared>) {
    loop {
        let state = match listener.accept().await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(listener = %listener.name(), error = %e, "Accept error");
                shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        if shared.stats.connections_active.load(Ordering::Relaxed) >= shared.max_connections {
            tracing::warn!(
                listener = %listener.name(),
                peer = %state.peer,
                "Connection limit reached, rejecting"
            );
            shared
                .stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            continue;
        }

        shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let span = state.span.clone();
        shared
            .tasks
            .spawn(serve_connection(listener.clone(), state, shared.clone()).instrument(span));
    }
}

async fn serve_connection(listener: Arc<BoundListener>, state: ConnectionState, shared: Arc<Shared>) {
    let handshake = tokio::select! {
        result = listener.handshake(state) => result,
        _ = shared.shutdown.cancelled() => {
            tracing::debug!("Shutdown during handshake");
            shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };
    let state = match handshake {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(listener = %listener.name(), error = %e, "TLS handshake failed");
            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };
    tracing::info!(
        listener = %listener.name(),
        transport = state.transport.transport_name(),
        "Client connected"
    );

    let (connection, mut incoming) = Connection::server(state, listener.mux_config().clone());
    shared
        .connections
        .insert(connection.id().to_string(), connection.clone());
    if shared.shutdown.is_cancelled() {
        connection.close();
    }

    while let Some(stream) = incoming.accept().await {
        shared.stats.streams_total.fetch_add(1, Ordering::Relaxed);
        let shared = shared.clone();
        let connection = connection.clone();
        tokio::spawn(
            async move {
                if let CallOutcome::Failed(reason) =
                    shared.registry.dispatch(stream, &connection).await
                {
                    shared.stats.streams_reset.fetch_add(1, Ordering::Relaxed);
                    if matches!(
                        reason.code,
                        ErrorCode::HandlerFailed | ErrorCode::InternalError
                    ) {
                        shared.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            .in_current_span(),
        );
    }

    let outcome = connection.closed().wait().await;
    shared.connections.remove(connection.id());
    shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        Ok(()) => tracing::info!("Client disconnected"),
        Err(reason) if reason.code == ErrorCode::ShuttingDown => {
            tracing::info!("Client disconnected during shutdown")
        }
        Err(reason) => {
            shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::info!(code = %reason.code, "Client disconnected: {}", reason.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use bytes::Bytes;
    use rpcmux_core::MuxConfig;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.listeners.0 = vec![ListenerConfig::tcp("test", "127.0.0.1:0".parse().unwrap())];
        config.shutdown.drain_deadline_secs = 1;
        config
    }

    fn echo_registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.unary("echo", |req: Bytes, _ctx| async move { Ok(req) });
        registry
    }

    async fn connect(addr: &ListenAddr) -> Connection {
        let stream = tokio::net::TcpStream::connect(addr.tcp().unwrap())
            .await
            .unwrap();
        let (connection, _) =
            Connection::client(ConnectionState::tcp(stream).unwrap(), MuxConfig::default());
        connection
    }

    #[tokio::test]
    async fn test_bind_reports_addresses() {
        let server = Server::new(test_config(), echo_registry());
        let addrs = server.bind().await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].tcp().unwrap().port(), 0);
        assert_eq!(server.local_addr("test"), Some(addrs[0].clone()));
        assert!(server.local_addr("other").is_none());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let mut config = test_config();
        config.listeners.0.clear();
        let server = Server::new(config, echo_registry());
        assert!(matches!(
            server.bind().await,
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let server = Arc::new(Server::new(test_config(), echo_registry()));
        let addr = server.bind().await.unwrap().remove(0);
        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        let connection = connect(&addr).await;
        let mut stream = connection.open_stream("echo").await.unwrap();
        stream.send_final("hi").await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), Bytes::from("hi"));
        assert!(server.is_running());
        assert!(matches!(server.run().await, Err(ServerError::AlreadyRunning)));

        server.shutdown();
        run.await.unwrap().unwrap();
        assert!(!server.is_running());

        let _ = connection.closed().wait().await;
        assert!(connection.is_closed());
        let stats = server.stats().snapshot();
        assert_eq!(stats.connections_total, 1);
        assert_eq!(stats.streams_total, 1);
        assert_eq!(stats.connections_active, 0);
    }

    #[tokio::test]
    async fn test_connection_limit_rejects() {
        let mut config = test_config();
        config.connection.max_connections = 1;
        let server = Arc::new(Server::new(config, echo_registry()));
        let addr = server.bind().await.unwrap().remove(0);
        let run = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        let first = connect(&addr).await;
        first.ping().await.unwrap();

        let second = connect(&addr).await;
        let _ = second.closed().wait().await;
        assert!(second.is_closed());
        assert_eq!(server.stats().snapshot().connections_rejected, 1);

        first.ping().await.unwrap();
        server.shutdown();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let stats = ServerStats::default();
        stats.streams_total.fetch_add(3, Ordering::Relaxed);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"streams_total\":3"));
    }
}
