mod cache;
mod config;
mod http;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{CacheService, CacheStore};
use crate::config::{Config, Overrides};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "narproxy", version, about = "Caching reverse proxy for Nix binary caches")]
struct Cli {
    /// Optional YAML configuration file; flags below override its values.
    #[arg(short, long, env = "NARPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the `narinfo/`, `nar/` and `tmp/` trees.
    #[arg(short = 's', long)]
    state_dir: Option<PathBuf>,

    /// Listen address, `host:port` or `:port`.
    #[arg(short = 'p', long)]
    listen: Option<String>,

    /// Expose `GET /lock` (unauthenticated).
    #[arg(short = 'l', long = "enable-lock")]
    enable_lock: bool,

    /// Log a `tick` line every second.
    #[arg(short = 't', long)]
    log_ticks: bool,

    /// Deadline in seconds for fetching one key from the upstreams.
    #[arg(long = "fetch-timeout")]
    fetch_timeout: Option<u64>,

    /// Serve `GET /metrics` on this address.
    #[arg(long)]
    metrics_listen: Option<String>,

    /// Upstream binary caches, tried in order.
    upstreams: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            state_dir: self.state_dir.clone(),
            listen: self.listen.clone(),
            enable_lock_route: self.enable_lock,
            log_ticks: self.log_ticks,
            upstreams: self.upstreams.clone(),
            fetch_timeout_secs: self.fetch_timeout,
            metrics_listen: self.metrics_listen.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: CacheService,
    pub metrics: MetricsRegistry,
    /// Cancelled once a shutdown signal arrives; long-lived responses watch it.
    pub shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

async fn run_http_server(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = http::handler::create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server error")
}

async fn run_metrics_server(
    metrics: MetricsRegistry,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = http::handler::create_metrics_router(metrics);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("metrics server error")
}

async fn bind(addr: std::net::SocketAddr, what: &str) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {what} listener on {addr}"))?;
    tracing::info!(%addr, "{what} listening");
    Ok(listener)
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI + config ----
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref(), cli.overrides())?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        state_dir = %config.state_dir.display(),
        upstreams = ?config.upstreams,
        "starting narproxy"
    );

    // ---- Store ----
    let store = CacheStore::open(&config.state_dir)?;
    store.sweep_scratch()?;

    // ---- Upstream client ----
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("narproxy/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .build()
        .context("failed to build reqwest client")?;

    if config.upstreams.is_empty() {
        tracing::warn!("no upstreams configured, every miss will be answered with 404");
    }
    if config.enable_lock_route {
        tracing::warn!("GET /lock is enabled and unauthenticated");
    }

    // ---- App state ----
    let metrics = MetricsRegistry::new();
    let cache = CacheService::new(
        store,
        config.upstream_bases(),
        http_client,
        config.fetch_timeout(),
        metrics.clone(),
    );
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        cache: cache.clone(),
        metrics: metrics.clone(),
        shutdown: shutdown.clone(),
    });

    // ---- Listeners ----
    let listener = bind(config.listen_addr()?, "HTTP").await?;
    let metrics_listener = match config.metrics_addr()? {
        Some(addr) => Some(bind(addr, "metrics").await?),
        None => None,
    };

    // ---- Spawn services ----
    let ticker_handle = config
        .log_ticks
        .then(|| tokio::spawn(cache::ticker::run_ticker(cache.guard().clone())));

    let metrics_handle = metrics_listener.map(|listener| {
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = run_metrics_server(metrics, listener, shutdown).await {
                    tracing::error!(error = %e, "metrics server failed");
                }
            }
        })
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    // ---- Serve until shutdown ----
    let result = run_http_server(state, listener, shutdown.clone()).await;
    shutdown.cancel();

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    if let Some(handle) = ticker_handle {
        handle.abort();
    }

    result?;
    tracing::info!("narproxy shut down cleanly");
    Ok(())
}
