use crate::api::ApiServer;
use crate::config::Config;
use anyhow::{Context, Result};
use flux_net::ProxyServer;
use flux_traits::{ConditionModel, Stats};
use mod_conditions::Simulator;
use mod_metrics::reporter::{StatsReporter, REPORT_INTERVAL};
use mod_metrics::MetricsCollector;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug)]
pub enum Command {
    Shutdown,
    ReportStats,
    Status(oneshot::Sender<EngineStatus>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStatus {
    pub proxy_addr: Option<SocketAddr>,
    pub api_addr: Option<SocketAddr>,
    pub stats: Stats,
}

/// Cloneable sender side of the engine's command bus.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Returns `false` if the engine has already stopped.
    pub async fn shutdown(&self) -> bool {
        self.command_tx.send(Command::Shutdown).await.is_ok()
    }

    pub async fn report_stats(&self) -> bool {
        self.command_tx.send(Command::ReportStats).await.is_ok()
    }

    /// Current addresses and stats, or `None` if the engine has stopped.
    pub async fn status(&self) -> Option<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(Command::Status(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Owns the proxy, the metrics endpoint and the stats reporter, and drives
/// them from a single command loop.
pub struct EngineCore {
    config: Config,
    collector: Arc<MetricsCollector>,
    proxy: Arc<ProxyServer>,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl EngineCore {
    pub fn new(config: Config) -> Self {
        let collector = Arc::new(MetricsCollector::new());
        let conditions: Arc<dyn ConditionModel> = Arc::new(Simulator::new(
            &config.latency,
            &config.packet_loss,
            &config.bandwidth,
        ));
        let proxy = Arc::new(ProxyServer::new(
            config.listen_address.clone(),
            config.upstream_address.clone(),
            conditions,
            collector.clone(),
        ));
        let (command_tx, command_rx) = mpsc::channel(100);

        Self {
            config,
            collector,
            proxy,
            command_tx,
            command_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    pub fn shared_state(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Runs until a `Shutdown` command arrives. Fails only if the proxy or
    /// the metrics endpoint cannot bind.
    pub async fn run(mut self) -> Result<()> {
        info!("Engine Core started.");

        let listener = self.proxy.bind().await.context("proxy startup failed")?;

        let mut api_addr = None;
        let mut api_task = None;
        if self.config.metrics.enabled {
            let api = ApiServer::new(self.config.metrics.clone(), self.collector.clone());
            let (addr, task) = api.spawn(self.cancel.child_token())?;
            api_addr = Some(addr);
            api_task = Some(task);
        } else {
            info!("Engine Core: metrics endpoint disabled.");
        }

        let reporter = StatsReporter::new(&self.config.metrics.log_dir).spawn(
            self.collector.clone(),
            REPORT_INTERVAL,
            self.cancel.child_token(),
        );

        let proxy = self.proxy.clone();
        let mut serving = tokio::spawn(async move { proxy.serve(listener).await });
        let mut serving_done = false;

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::ReportStats) => {
                        let stats = self.collector.get_stats();
                        info!(
                            "Stats: active={} total={} bytes={} lost={} avg_latency={:.2}ms",
                            stats.active_connections,
                            stats.total_connections,
                            stats.total_bytes,
                            stats.packets_lost,
                            stats.average_latency_ms
                        );
                    }
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(EngineStatus {
                            proxy_addr: self.proxy.local_addr(),
                            api_addr,
                            stats: self.collector.get_stats(),
                        });
                    }
                    Some(Command::Shutdown) | None => break,
                },
                joined = &mut serving, if !serving_done => {
                    serving_done = true;
                    if let Err(e) = joined {
                        error!("Engine Core: accept loop failed: {}", e);
                    }
                    warn!("Engine Core: accept loop exited unexpectedly.");
                    break;
                }
            }
        }

        info!("Engine Core shutting down.");
        self.proxy.shutdown().await;
        if !serving_done {
            let _ = serving.await;
        }

        self.cancel.cancel();
        let _ = reporter.await;
        if let Some(task) = api_task {
            let _ = task.await;
        }

        info!("Engine Core stopped.");
        Ok(())
    }
}
