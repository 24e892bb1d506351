// packages/engine/src/runtime/task_unit.rs
//! Execution unit backed by a tokio task
//!
//! The stock [`UnitBuilder`] for hosts whose workloads are plain async
//! functions. Each unit spawns the workload once; it stays active until the
//! workload returns. Disposal asks the workload to stop through its
//! cancellation token, waits up to `stop_grace`, then aborts the task.

use crate::runtime::notifier::{Payload, UnitEmitter};
use crate::runtime::tenant::TenantContext;
use crate::runtime::unit::{ExecutionUnit, UnitBuilder};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for task-backed units
#[derive(Debug, Clone)]
pub struct TaskUnitConfig {
    /// How long dispose waits for a cooperative stop before aborting
    pub stop_grace: Duration,
}

impl Default for TaskUnitConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Everything a workload gets when its unit starts
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub tenant: TenantContext,
    pub emitter: UnitEmitter,

    /// Cancelled when the unit is disposed
    pub cancel: CancellationToken,
}

/// A running workload registered with the factory
pub struct TaskUnit {
    tenant_id: String,
    run_id: String,
    created_at: DateTime<Utc>,
    config: TaskUnitConfig,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskUnit {
    fn label(&self) -> String {
        format!("{}:{}", self.tenant_id, self.run_id)
    }

    /// True once dispose has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl ExecutionUnit for TaskUnit {
    fn is_active(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn dispose(&self) -> Result<()> {
        self.cancel.cancel();

        let task = self.task.lock().await.take();
        let Some(mut task) = task else {
            return Ok(());
        };

        match tokio::time::timeout(self.config.stop_grace, &mut task).await {
            Ok(Ok(())) => debug!("Task unit {} stopped", self.label()),
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => {
                self.finished.store(true, Ordering::SeqCst);
                return Err(EngineError::DisposalFailed {
                    key: self.label(),
                    reason: format!("workload panicked: {}", e),
                });
            }
            Err(_) => {
                warn!(
                    "Task unit {} did not stop within {:?}, aborting",
                    self.label(),
                    self.config.stop_grace
                );
                task.abort();
            }
        }

        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds [`TaskUnit`]s by spawning `workload` for each context
pub struct TaskUnitBuilder<F> {
    config: TaskUnitConfig,
    workload: F,
}

impl<F, Fut> TaskUnitBuilder<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(workload: F) -> Self {
        Self::with_config(TaskUnitConfig::default(), workload)
    }

    pub fn with_config(config: TaskUnitConfig, workload: F) -> Self {
        Self { config, workload }
    }
}

#[async_trait]
impl<F, Fut> UnitBuilder for TaskUnitBuilder<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    type Unit = TaskUnit;

    async fn build(&self, ctx: &TenantContext, emitter: UnitEmitter) -> Result<TaskUnit> {
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let workload = (self.workload)(TaskContext {
            tenant: ctx.clone(),
            emitter: emitter.clone(),
            cancel: cancel.clone(),
        });

        let done = Arc::clone(&finished);
        let task = tokio::spawn(async move {
            match workload.await {
                Ok(()) => emitter.emit("unit_completed", Payload::new()),
                Err(e) => {
                    warn!(
                        "Workload for tenant {} run {} failed: {}",
                        emitter.tenant_id(),
                        emitter.run_id(),
                        e
                    );
                    let mut payload = Payload::new();
                    payload.insert("error".to_string(), Value::from(e.to_string()));
                    emitter.emit("unit_failed", payload);
                }
            }
            done.store(true, Ordering::SeqCst);
        });

        Ok(TaskUnit {
            tenant_id: ctx.tenant_id.clone(),
            run_id: ctx.run_id.clone(),
            created_at: Utc::now(),
            config: self.config.clone(),
            cancel,
            finished,
            task: Mutex::new(Some(task)),
        })
    }
}
