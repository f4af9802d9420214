//! cmdrelay-daemon - authenticated real-time command relay
//!
//! Loads configuration, wires the session store, upstream client and
//! metrics, and serves the relay until SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cmdrelay_core::config::RelayConfig;
use cmdrelay_daemon::metrics::{MetricsRegistry, run_metrics_server};
use cmdrelay_daemon::upstream::build_http_client;
use cmdrelay_daemon::{AppState, ShutdownHandle, router};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// cmdrelay daemon - authenticated real-time command relay
#[derive(Parser, Debug)]
#[command(name = "cmdrelay-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to relay configuration file
    #[arg(short, long, default_value = "cmdrelay.toml")]
    config: PathBuf,

    /// Override `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override `upstream.base_url`
    #[arg(long)]
    upstream_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Override `server.metrics_addr`
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = if args.config.exists() {
        RelayConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        warn!(path = %args.config.display(), "configuration file not found, using defaults");
        RelayConfig::default()
    };

    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(url) = &args.upstream_url {
        config.upstream.base_url.clone_from(url);
    }
    if let Some(addr) = args.metrics_addr {
        config.server.metrics_addr = addr;
    }
    if args.no_metrics {
        config.server.metrics_enabled = false;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Registered termination signals.
struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    /// Installs the SIGTERM and SIGINT handlers. Must run inside the runtime.
    fn register() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("failed to register SIGTERM")?,
            sigint: signal(SignalKind::interrupt()).context("failed to register SIGINT")?,
        })
    }

    async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!("Received SIGTERM"),
            _ = self.sigint.recv() => info!("Received SIGINT"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = load_config(&args)?;
    if config.relay.idle_timeout_secs.is_none() {
        warn!("relay.idle_timeout_secs is not set; silent upstreams are held open indefinitely");
    }

    let signals = ShutdownSignals::register()?;

    let http = build_http_client(config.upstream.connect_timeout())
        .context("failed to build HTTP client")?;
    let registry = Arc::new(MetricsRegistry::new().context("failed to register metrics")?);
    let shutdown = ShutdownHandle::new();

    let state = AppState::from_config(
        &config,
        http,
        registry.relay_metrics().clone(),
        shutdown.clone(),
    )
    .context("invalid relay settings")?;

    let metrics_task = if config.server.metrics_enabled {
        let mut metrics_signal = shutdown.subscribe();
        let addr = config.server.metrics_addr;
        let registry = Arc::clone(&registry);
        Some(tokio::spawn(async move {
            let stop = async move { metrics_signal.wait().await };
            if let Err(e) = run_metrics_server(registry, addr, stop).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        info!("Metrics HTTP server disabled");
        None
    };

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(
        addr = %listener.local_addr()?,
        upstream = %config.upstream.base_url,
        store = ?config.session.store,
        "relay listening"
    );

    let signal_shutdown = shutdown.clone();
    let mut server_signal = shutdown.subscribe();
    let signal_task = tokio::spawn(async move {
        signals.recv().await;
        signal_shutdown.request_shutdown();
    });

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { server_signal.wait().await })
        .await
        .context("relay server failed")?;

    signal_task.abort();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    info!("relay stopped");
    Ok(())
}
