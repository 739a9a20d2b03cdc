pub mod api;
pub mod config;
pub mod engine;

use anyhow::Result;
use config::Config;
use engine::{EngineCore, EngineHandle};
use mod_metrics::MetricsCollector;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Validates the configuration, spawns the engine and hands back its command
/// handle, the live collector, and the task to await for the exit status.
pub fn init_core(config: Config) -> Result<(EngineHandle, Arc<MetricsCollector>, JoinHandle<Result<()>>)> {
    config.validate()?;
    tracing::info!(
        "Initializing core: {} -> {}",
        config.listen_address,
        config.upstream_address
    );

    let engine = EngineCore::new(config);
    let handle = engine.handle();
    let shared_state = engine.shared_state();
    let task = tokio::spawn(engine.run());

    Ok((handle, shared_state, task))
}
