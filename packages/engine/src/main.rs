// packages/engine/src/main.rs
//! Tenant Engine
//!
//! Standalone host: loads configuration, installs tracing and metrics, and
//! runs a factory of task-backed units until interrupted.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tenant_engine::observability::{init_metrics, init_tracing};
use tenant_engine::runtime::{
    ExecutionEngineFactory, Payload, TaskContext, TaskUnitBuilder, TenantContext, TracingNotifier,
};
use tenant_engine::utils::config::EngineConfig;
use tenant_engine::{BuildInfo, EngineError, RetryEngine};
use tracing::{error, info};

/// Interval between heartbeat events emitted by each unit
const HEARTBEAT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; logging settings live in it
    let config = EngineConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        "Starting Tenant Engine v{} ({}, {})",
        build.version, build.git_hash, build.rustc_version
    );
    info!("Configuration loaded: {:?}", config);

    let retry = RetryEngine::from_settings(&config.retry)?;
    info!(
        "Creation retries use policy '{}' ({} attempts)",
        retry.policy().name,
        retry.policy().max_attempts
    );

    let builder = TaskUnitBuilder::new(|task: TaskContext| async move {
        let mut ticker = tokio::time::interval(HEARTBEAT);
        let mut beats: u64 = 0;
        loop {
            tokio::select! {
                _ = task.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    beats += 1;
                    let mut payload = Payload::new();
                    payload.insert("beats".to_string(), Value::from(beats));
                    task.emitter.emit("heartbeat", payload);
                }
            }
        }
        Ok::<(), EngineError>(())
    });

    let factory = ExecutionEngineFactory::with_notifier(
        config.factory.to_factory_config(),
        builder,
        Arc::new(TracingNotifier),
    )?;

    // Bring up one unit for the local tenant so the reaper has work
    let created = retry
        .execute(|| factory.create_for_user(TenantContext::new("local")))
        .await;
    match created.into_result() {
        Ok(handle) => info!("Local unit {} ready", handle.key()),
        Err(e) => error!("Failed to create local unit: {}", e),
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C signal handler")?;
    info!("Received shutdown signal, cleaning up...");

    factory.shutdown().await;
    info!("Final metrics: {}", serde_json::to_string(&factory.metrics().await)?);

    Ok(())
}
