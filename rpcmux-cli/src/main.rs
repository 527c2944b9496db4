//! rpcmux-cli - Command-line client for rpcmux servers
//!
//! One-shot calls of any shape against any operation a server registers.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rpcmux_client::{Client, ConnectConfig, Endpoint, TlsClientConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rpcmux-cli")]
#[command(about = "Command-line client for rpcmux servers")]
#[command(version)]
struct Cli {
    /// Server endpoint: host:port, tcp://host:port or unix://path
    #[arg(short, long, default_value = "127.0.0.1:7411", env = "RPCMUX_SERVER")]
    server: Endpoint,

    /// Call timeout in seconds (0 waits indefinitely)
    #[arg(long, default_value = "30")]
    timeout: u64,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "RPCMUX_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "RPCMUX_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "RPCMUX_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "RPCMUX_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Measure round trips to the server
    Ping {
        /// Number of pings
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
    },

    /// List the operations the server registers
    Ops,

    /// Unary call: one request, one response
    Call {
        /// Operation name
        op: String,

        /// Request payload (or @file to read from file)
        #[arg(default_value = "")]
        data: String,

        /// Call metadata as KEY=VALUE (repeatable)
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
    },

    /// Client-streaming call: each message in order, then one response
    Send {
        /// Operation name
        op: String,

        /// Messages to send (each may be @file)
        messages: Vec<String>,

        /// Call metadata as KEY=VALUE (repeatable)
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
    },

    /// Server-streaming call: prints responses until the stream ends
    Stream {
        /// Operation name
        op: String,

        /// Request payload (or @file to read from file)
        #[arg(default_value = "")]
        data: String,

        /// Call metadata as KEY=VALUE (repeatable)
        #[arg(short, long = "meta")]
        metadata: Vec<String>,

        /// Cancel after this many responses
        #[arg(long)]
        take: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Build TLS config if any TLS option is set
    let tls_config =
        if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
            let mut tls = TlsClientConfig::new();
            if let Some(ref path) = cli.ca_cert {
                tls = tls.with_ca_cert(path);
            }
            match (&cli.client_cert, &cli.client_key) {
                (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
                (None, None) => {}
                _ => {
                    eprintln!(
                        "{}: --client-cert and --client-key must be used together",
                        "Error".red()
                    );
                    std::process::exit(1);
                }
            }
            if cli.insecure {
                tls = tls.with_insecure();
            }
            if let Some(ref name) = cli.server_name {
                tls = tls.with_server_name(name);
            }
            Some(tls)
        } else {
            None
        };

    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));
    let mut config = ConnectConfig::new(cli.server.clone()).with_call_timeout(timeout);
    if let Some(tls) = tls_config {
        config = config.with_tls(tls);
    }

    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{} to {}: {}", "Connection failed".red(), cli.server, e);
        e
    })?;
    tracing::debug!(server = %cli.server, "connected");

    match commands::execute(&client, cli.command).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            client.close(Duration::from_secs(1)).await;
            std::process::exit(1);
        }
    }

    client.close(Duration::from_secs(5)).await;
    Ok(())
}
