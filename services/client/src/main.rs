//! burrow-client
//!
//! Starts the SOCKS5 and/or HTTP listeners, connects the channel pool to the
//! tunnel server and relays every accepted connection until ctrl-c.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use burrow_client::{Inbound, ListenerConfig, Protocol};
use burrow_core::config::{self, ClientConfig};
use burrow_core::{build_endpoint, tls, BufferPool, ConnPool, EgressFactory, Route, RouteEngine, Stats};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Local proxy that tunnels connections to a burrow server.
#[derive(Debug, Parser)]
#[command(name = "burrow-client", version)]
struct Args {
    /// Path to the JSON client configuration.
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

fn parse_bind(addr: &str, field: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {field} {addr:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config: ClientConfig = config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    init_tracing(
        args.log_level.as_deref().unwrap_or(&config.log_level),
        args.log_format,
    );

    info!("Starting burrow client");
    info!(
        server_addr = %config.server_addr,
        mux = config.mux,
        tls = config.tls.enabled,
        routes = config.routes.len(),
        "Configuration loaded"
    );
    if config.bandwidth_kbps.is_some() {
        info!("bandwidth_kbps is reserved and has no effect");
    }

    let tls = tls::client_tls(&config.tls, &config.server_addr)
        .context("failed to load TLS settings")?;
    let endpoint = build_endpoint(&config.server_addr, tls)?;
    let pool = Arc::new(ConnPool::new(config.mux, endpoint));
    pool.init()
        .await
        .with_context(|| format!("failed to connect to {}", config.server_addr))?;

    let stats = Stats::new();
    let buffers = BufferPool::new(config.buffer_kb);
    let factory = EgressFactory::new(Arc::clone(&stats), Arc::clone(&buffers), config.network())
        .with_forward(config.forward_upstream()?)
        .with_rpc(Arc::clone(&pool), config.user_id.clone());
    let routes = Arc::new(
        RouteEngine::new(config.routes(), Route::client_default(), factory)
            .context("failed to build route table")?,
    );

    let shutdown = CancellationToken::new();
    let pipe_size = buffers.buffer_size();
    let bindings = [
        (config.socks_addr.as_deref(), Protocol::Socks5, "socks_addr"),
        (config.http_addr.as_deref(), Protocol::Http, "http_addr"),
    ];

    let mut listener_handles = Vec::new();
    for (addr, protocol, field) in bindings {
        let Some(addr) = addr else { continue };
        let listener_config = ListenerConfig::new(parse_bind(addr, field)?, protocol, pipe_size);

        let listener = match Inbound::bind(listener_config, Arc::clone(&routes), shutdown.clone()).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                error!(bind_addr = %addr, protocol = %protocol, error = %e, "Failed to bind listener");
                return Err(e.into());
            }
        };
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "Listener error");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");

    shutdown.cancel();
    for handle in listener_handles {
        let _ = handle.await;
    }
    pool.destroy();

    let totals = stats.snapshot();
    info!(tx_bytes = totals.tx, rx_bytes = totals.rx, "burrow client stopped");
    Ok(())
}
