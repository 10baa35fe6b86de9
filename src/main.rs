//! HTTP request forwarder.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request        ┌──────────────────────────────────────────────┐
//!     ──────────────────────┼─▶ http server ──▶ routing ──▶ forwarder ─────┼──▶ Destination
//!                           │                                  │           │
//!     Client Response       │                                  ▼           │
//!     ◀─────────────────────┼── client response ◀── stream copier ◀────────┼─── Response
//!                           │                                              │
//!                           │  config · observability · lifecycle          │
//!                           └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use http_forwarder::config::load_config;
use http_forwarder::lifecycle::{shutdown_on_signal, Shutdown};
use http_forwarder::observability::{logging, metrics};
use http_forwarder::{HttpServer, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "http-forwarder", version, about = "HTTP request forwarder")]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "HTTP_FORWARDER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "http-forwarder starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        activity_timeout_secs = config.forwarder.activity_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let server = HttpServer::new(config);
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
