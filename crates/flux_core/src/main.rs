use anyhow::Context;
use clap::Parser;
use flux_core::config::Config;
use flux_core::init_core;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "config.yaml";

/// TCP proxy that injects latency, packet loss and bandwidth limits.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a YAML or JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listen_address, e.g. 0.0.0.0:42069
    #[arg(short, long)]
    listen: Option<String>,

    /// Override upstream_address, e.g. 127.0.0.1:8080
    #[arg(short, long)]
    upstream: Option<String>,

    /// Directory for the operational log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::daily(&cli.log_dir, "flux.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    tracing::info!("Booting flux network simulator...");
    raise_fd_limit();

    let config = load_config(&cli)?;
    let (handle, _stats, mut engine) = init_core(config)?;

    tokio::select! {
        joined = &mut engine => {
            return joined.context("engine task panicked")?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, draining connections...");
            handle.report_stats().await;
            handle.shutdown().await;
        }
    }

    engine.await.context("engine task panicked")??;
    tracing::info!("Shutdown complete.");
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => {
            Config::load(DEFAULT_CONFIG).with_context(|| format!("loading {DEFAULT_CONFIG}"))?
        }
        None => {
            tracing::warn!("No config file given and {} not found; using defaults.", DEFAULT_CONFIG);
            Config::default()
        }
    };

    if let Some(listen) = &cli.listen {
        config.listen_address = listen.clone();
    }
    if let Some(upstream) = &cli.upstream {
        config.upstream_address = upstream.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Lifts the soft descriptor limit so bursts of connections do not starve accept().
fn raise_fd_limit() {
    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(limit) => tracing::info!("File descriptor limit: {}", limit),
        Err(e) => tracing::warn!("Could not raise file descriptor limit: {}", e),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
