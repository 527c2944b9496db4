//! rpcmux - multiplexed RPC server
//!
//! Serves the built-in diagnostic operations on every configured listener.

use rpcmux_server::{register_diagnostics, Config, Server, ServiceRegistry, TransportConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RPCMUX_CONFIG is set, then env overrides)
    let config_path = std::env::var("RPCMUX_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting rpcmux server");
    for listener in config.listeners.iter() {
        let transport = match &listener.transport {
            TransportConfig::Tcp { bind_addr } => format!("tcp {}", bind_addr),
            TransportConfig::Unix { path } => format!("unix {}", path.display()),
        };
        let tls = match &listener.tls {
            Some(tls) if tls.require_client_cert => "mTLS",
            Some(_) => "TLS",
            None => "plain",
        };
        tracing::info!("  Listener '{}': {} ({})", listener.name, transport, tls);
    }
    tracing::info!(
        "  Limits: {} connections, {} streams per connection",
        config.connection.max_connections,
        config.connection.max_streams
    );
    tracing::info!(
        "  Drain deadline: {}s",
        config.shutdown.drain_deadline_secs
    );

    let mut registry = ServiceRegistry::new();
    register_diagnostics(&mut registry);

    let server = Arc::new(Server::new(config, registry));
    for addr in server.bind().await? {
        tracing::info!("Listening on {}", addr);
    }

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, draining connections...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown and drain complete)
    server.run().await?;

    match serde_json::to_string(&server.stats().snapshot()) {
        Ok(stats) => tracing::info!(stats = %stats, "Server stopped"),
        Err(_) => tracing::info!("Server stopped"),
    }
    Ok(())
}
