//! burrow-server
//!
//! Hosts the `Tunnel` gRPC service: authenticates tunnel streams against the
//! user allowlist, routes each target and relays bytes until the client or
//! target finishes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_core::config::{self, ServerConfig};
use burrow_core::{tls, BufferPool, EgressFactory, Route, RouteEngine, Stats, TunnelService};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// burrow tunnel server.
#[derive(Debug, Parser)]
#[command(name = "burrow-server", version)]
struct Args {
    /// Path to the JSON server configuration.
    #[arg(short, long, env = "BURROW_CONFIG")]
    config: PathBuf,

    /// Log filter; overrides `log_level` from the config file.
    #[arg(long, env = "BURROW_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, env = "BURROW_LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormat,
}

fn init_tracing(level: &str, format: LogFormat) {
    // Prefer RUST_LOG, fall back to the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config: ServerConfig = config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    init_tracing(
        args.log_level.as_deref().unwrap_or(&config.log_level),
        args.log_format,
    );

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {:?}", config.listen_addr))?;

    info!("Starting burrow server");
    info!(
        listen_addr = %listen_addr,
        tls = config.tls.enabled,
        users = config.users.len(),
        routes = config.routes.len(),
        "Configuration loaded"
    );

    let stats = Stats::new();
    let buffers = BufferPool::new(config.buffer_kb);
    let network = config.network();
    let factory = EgressFactory::new(Arc::clone(&stats), Arc::clone(&buffers), network)
        .with_forward(config.forward_upstream()?);
    let routes = Arc::new(
        RouteEngine::new(config.routes(), Route::server_default(), factory)
            .context("failed to build route table")?,
    );

    let shutdown = CancellationToken::new();
    let service = TunnelService::new(
        config.user_set(),
        routes,
        network,
        buffers,
        shutdown.clone(),
    );

    let mut builder = Server::builder();
    if let Some(tls) = tls::server_tls(&config.tls).context("failed to load TLS identity")? {
        builder = builder
            .tls_config(tls)
            .context("failed to configure TLS")?;
    }

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown.cancel();
        }
    };

    info!(listen_addr = %listen_addr, "Tunnel service listening");
    builder
        .add_service(service.into_server())
        .serve_with_shutdown(listen_addr, signal)
        .await
        .context("tunnel server failed")?;

    let totals = stats.snapshot();
    info!(tx_bytes = totals.tx, rx_bytes = totals.rx, "burrow server stopped");
    Ok(())
}
