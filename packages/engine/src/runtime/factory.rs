// packages/engine/src/runtime/factory.rs
//! Multi-tenant execution engine factory
//!
//! Creates execution units on behalf of tenants, caps how many each tenant
//! may hold, and guarantees every unit is disposed exactly once: by an
//! explicit cleanup, by the background reaper, or at shutdown.
//!
//! # Architecture
//!
//! ```text
//! create_for_user(ctx)                     cleanup / cleanup_user
//!        │                                          │
//!        ▼                                          ▼
//! ┌──────────────── registry lock ───────────────────────────────┐
//! │ validate → limiter.admit → builder.build → insert            │
//! │                                   claim (disposing = true)   │
//! └──────────────────────────────────────────────────────────────┘
//!                                                   │
//!                               spawn disposal task (still locked)
//!                                                   │
//!                         ┌──────── disposal task ───────────┐
//!                         │ dispose (bounded) → finish       │ ◄── reaper tick
//!                         └──────────────────────────────────┘
//! ```
//!
//! The builder runs while the registry lock is held, so two concurrent
//! creations for one tenant can never both pass the limit check.
//!
//! A claimed unit is handed to its disposal task before the lock is
//! released. The task owns both the dispose hook and the registry removal,
//! so a caller that stops waiting, or a reaper aborted at shutdown, cannot
//! strand a claimed entry.

use crate::runtime::notifier::{NoopNotifier, Notifier, Payload, UnitEmitter};
use crate::runtime::reaper::{self, ReapSummary};
use crate::runtime::registry::{EvictionReason, MetricsSnapshot, UnitRegistry};
use crate::runtime::resource_limiter::{TenantLimits, TenantResourceLimiter};
use crate::runtime::tenant::TenantContext;
use crate::runtime::unit::{EngineHandle, ExecutionUnit, UnitBuilder, UnitKey};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Factory configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FactoryConfig {
    /// Live units allowed per tenant (default: 3)
    pub max_engines_per_tenant: usize,

    /// Age after which the reaper evicts a unit (default: 30 minutes)
    pub unit_timeout: Duration,

    /// Reaper tick interval (default: 60 seconds)
    pub cleanup_interval: Duration,

    /// How long shutdown waits for the reaper to stop (default: 10 seconds)
    pub shutdown_grace: Duration,

    /// Budget for a single dispose hook (default: 30 seconds)
    pub dispose_timeout: Duration,

    /// Tenant-specific caps
    pub tenant_overrides: HashMap<String, usize>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_engines_per_tenant: 3,
            unit_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            dispose_timeout: Duration::from_secs(30),
            tenant_overrides: HashMap::new(),
        }
    }
}

impl FactoryConfig {
    pub fn limits(&self) -> TenantLimits {
        TenantLimits {
            max_engines_per_tenant: self.max_engines_per_tenant,
            overrides: self.tenant_overrides.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.limits().validate()?;

        for (name, value) in [
            ("unit_timeout", self.unit_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("dispose_timeout", self.dispose_timeout),
        ] {
            if value.is_zero() {
                return Err(EngineError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisposeOutcome {
    Disposed,
    Failed,
    /// The dispose task panicked or was cancelled
    Aborted,
}

/// Shared state behind every factory clone and the reaper
pub(crate) struct FactoryInner<B: UnitBuilder> {
    config: FactoryConfig,
    builder: B,
    notifier: Arc<dyn Notifier>,
    limiter: TenantResourceLimiter,
    registry: Mutex<UnitRegistry<B::Unit>>,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    disposals: TaskTracker,
}

impl<B: UnitBuilder> FactoryInner<B> {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// One reaper pass: evict inactive and over-age units
    pub(crate) async fn reap(self: &Arc<Self>) -> ReapSummary {
        let mut summary = ReapSummary::default();
        let mut tasks = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            for (handle, reason) in registry.claim_expired(Utc::now(), self.config.unit_timeout) {
                match reason {
                    EvictionReason::Inactive => summary.inactive += 1,
                    EvictionReason::TimedOut => summary.timed_out += 1,
                    _ => {}
                }
                tasks.push(self.spawn_disposal(handle, reason));
            }
        }
        join_disposals(tasks).await;

        if summary.total() > 0 {
            info!(
                "Reaper evicted {} inactive and {} timed-out units",
                summary.inactive, summary.timed_out
            );
        }
        summary
    }

    /// Start disposing a unit that was just claimed.
    ///
    /// Call this before the registry lock that made the claim is released.
    fn spawn_disposal(
        self: &Arc<Self>,
        handle: EngineHandle<B::Unit>,
        reason: EvictionReason,
    ) -> JoinHandle<DisposeOutcome> {
        let inner = Arc::clone(self);
        self.disposals
            .spawn(async move { inner.dispose_unit(handle, reason).await })
    }

    /// Dispose a claimed unit and drop it from the registry
    async fn dispose_unit(
        &self,
        handle: EngineHandle<B::Unit>,
        reason: EvictionReason,
    ) -> DisposeOutcome {
        let unit = Arc::clone(handle.unit());
        let task = tokio::spawn(async move { unit.dispose().await });
        let abort = task.abort_handle();

        let outcome = match tokio::time::timeout(self.config.dispose_timeout, task).await {
            Ok(Ok(Ok(()))) => DisposeOutcome::Disposed,
            Ok(Ok(Err(e))) => {
                warn!("Failed to dispose unit {}: {}", handle.key(), e);
                DisposeOutcome::Failed
            }
            Ok(Err(e)) => {
                error!("Dispose task for unit {} did not complete: {}", handle.key(), e);
                DisposeOutcome::Aborted
            }
            Err(_) => {
                abort.abort();
                warn!(
                    "Disposing unit {} exceeded {:?}, abandoning it",
                    handle.key(),
                    self.config.dispose_timeout
                );
                DisposeOutcome::Failed
            }
        };

        let removed = self.registry.lock().await.finish(
            handle.key(),
            reason,
            outcome != DisposeOutcome::Disposed,
        );

        if removed {
            debug!("Unit {} removed ({})", handle.key(), reason.as_str());
            let event = match reason {
                EvictionReason::Inactive | EvictionReason::TimedOut => "unit_evicted",
                EvictionReason::Explicit | EvictionReason::Shutdown => "unit_cleaned",
            };
            let mut payload = Payload::new();
            payload.insert("key".to_string(), Value::from(handle.key().as_str()));
            payload.insert("reason".to_string(), Value::from(reason.as_str()));
            self.emitter_for(&handle).emit(event, payload);
        }

        outcome
    }

    fn emitter_for(&self, handle: &EngineHandle<B::Unit>) -> UnitEmitter {
        UnitEmitter::new(Arc::clone(&self.notifier), handle.tenant_id(), handle.run_id())
    }
}

async fn join_disposals(tasks: Vec<JoinHandle<DisposeOutcome>>) -> Vec<DisposeOutcome> {
    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap_or(DisposeOutcome::Aborted))
        .collect()
}

impl<B: UnitBuilder> Drop for FactoryInner<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.is_shut_down() {
            return;
        }
        if let Ok(registry) = self.registry.try_lock() {
            if registry.len() > 0 {
                warn!(
                    "Factory dropped without shutdown; {} units were never disposed",
                    registry.len()
                );
            }
        }
    }
}

/// Multi-tenant factory for execution units
///
/// Cloning is cheap; all clones share one registry and one reaper.
pub struct ExecutionEngineFactory<B: UnitBuilder> {
    inner: Arc<FactoryInner<B>>,
}

impl<B: UnitBuilder> Clone for ExecutionEngineFactory<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: UnitBuilder> ExecutionEngineFactory<B> {
    /// Factory that discards lifecycle events
    pub fn new(config: FactoryConfig, builder: B) -> Result<Self> {
        Self::with_notifier(config, builder, Arc::new(NoopNotifier))
    }

    pub fn with_notifier(
        config: FactoryConfig,
        builder: B,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Creating execution engine factory (max {} per tenant, timeout {:?}, cleanup every {:?})",
            config.max_engines_per_tenant, config.unit_timeout, config.cleanup_interval
        );

        let limiter = TenantResourceLimiter::new(config.limits());

        Ok(Self {
            inner: Arc::new(FactoryInner {
                config,
                builder,
                notifier,
                limiter,
                registry: Mutex::new(UnitRegistry::new()),
                reaper: parking_lot::Mutex::new(None),
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                disposals: TaskTracker::new(),
            }),
        })
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    /// Build and register a unit for `ctx.tenant_id`
    pub async fn create_for_user(&self, ctx: TenantContext) -> Result<EngineHandle<B::Unit>> {
        let inner = &self.inner;

        if inner.is_shut_down() {
            inner.registry.lock().await.record_creation_error();
            return Err(EngineError::ShuttingDown);
        }
        if let Err(e) = ctx.validate() {
            inner.registry.lock().await.record_creation_error();
            warn!("Rejecting creation request: {}", e);
            return Err(e);
        }

        let mut registry = inner.registry.lock().await;

        if inner.is_shut_down() {
            registry.record_creation_error();
            return Err(EngineError::ShuttingDown);
        }
        if registry.contains_run(&ctx.tenant_id, &ctx.run_id) {
            registry.record_creation_error();
            return Err(EngineError::InvalidContext(format!(
                "run '{}' is already registered for tenant '{}'",
                ctx.run_id, ctx.tenant_id
            )));
        }

        let live = registry.live_for_tenant(&ctx.tenant_id);
        if let Err(e) = inner.limiter.admit(&ctx.tenant_id, live) {
            registry.record_limit_rejection();
            warn!(
                "Tenant {} at capacity ({} live units), rejecting run {}",
                ctx.tenant_id, live, ctx.run_id
            );
            return Err(e);
        }

        let created_at = Utc::now();
        let key = UnitKey::new(&ctx.tenant_id, &ctx.run_id, created_at);
        if registry.contains_key(&key) {
            registry.record_creation_error();
            return Err(EngineError::InvalidContext(format!(
                "unit key {} is already registered",
                key
            )));
        }

        let emitter = UnitEmitter::new(Arc::clone(&inner.notifier), &ctx.tenant_id, &ctx.run_id);
        let unit = match inner.builder.build(&ctx, emitter.clone()).await {
            Ok(unit) => unit,
            Err(e) => {
                registry.record_creation_error();
                error!("Failed to build unit for tenant {}: {}", ctx.tenant_id, e);
                return Err(e);
            }
        };

        let handle = EngineHandle::new(key, &ctx, created_at, Arc::new(unit));
        registry.insert(handle.clone());
        let active = registry.len();
        drop(registry);

        info!(
            "Created unit {} for tenant {} ({} active)",
            handle.key(),
            ctx.tenant_id,
            active
        );

        let mut payload = Payload::new();
        payload.insert("key".to_string(), Value::from(handle.key().as_str()));
        emitter.emit("unit_created", payload);

        self.ensure_reaper();
        Ok(handle)
    }

    /// Dispose and remove one unit. Returns false if it was already gone.
    ///
    /// Dropping the returned future does not interrupt the disposal.
    pub async fn cleanup(&self, handle: &EngineHandle<B::Unit>) -> bool {
        let task = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .claim(handle.key())
                .map(|claimed| self.inner.spawn_disposal(claimed, EvictionReason::Explicit))
        };

        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!("Disposal of unit {} was interrupted: {}", handle.key(), e);
                }
                true
            }
            None => {
                debug!("Unit {} already cleaned up", handle.key());
                false
            }
        }
    }

    /// Dispose every unit of one tenant, concurrently.
    ///
    /// Disposal errors are logged and counted; only a dispose task that
    /// panicked or was cancelled makes this return false.
    pub async fn cleanup_user(&self, tenant_id: &str) -> bool {
        let tasks: Vec<_> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .claim_tenant(tenant_id)
                .into_iter()
                .map(|handle| self.inner.spawn_disposal(handle, EvictionReason::Explicit))
                .collect()
        };
        if tasks.is_empty() {
            debug!("No units to clean up for tenant {}", tenant_id);
            return true;
        }

        info!("Cleaning up {} units for tenant {}", tasks.len(), tenant_id);

        join_disposals(tasks)
            .await
            .into_iter()
            .all(|outcome| outcome != DisposeOutcome::Aborted)
    }

    /// Stop the reaper and dispose everything. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Factory already shut down");
            return;
        }

        info!("Shutting down execution engine factory");
        inner.cancel.cancel();

        let reaper = inner.reaper.lock().take();
        if let Some(mut reaper) = reaper {
            match tokio::time::timeout(inner.config.shutdown_grace, &mut reaper).await {
                Ok(Ok(())) => debug!("Reaper stopped"),
                Ok(Err(e)) => warn!("Reaper task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Reaper did not stop within {:?}, aborting it",
                        inner.config.shutdown_grace
                    );
                    reaper.abort();
                }
            }
        }

        let tasks: Vec<_> = {
            let mut registry = inner.registry.lock().await;
            registry
                .claim_all()
                .into_iter()
                .map(|handle| inner.spawn_disposal(handle, EvictionReason::Shutdown))
                .collect()
        };
        let disposed = tasks.len();

        // Also covers disposals a reaper pass or a cleanup already started
        inner.disposals.close();
        let deadline = inner.config.dispose_timeout + inner.config.shutdown_grace;
        if tokio::time::timeout(deadline, inner.disposals.wait()).await.is_err() {
            warn!(
                "{} disposal tasks still running after {:?}",
                inner.disposals.len(),
                deadline
            );
        }

        let leftover = inner.registry.lock().await.clear();
        if leftover > 0 {
            warn!("Dropped {} units still mid-disposal at shutdown", leftover);
        }

        let mut payload = Payload::new();
        payload.insert("disposed".to_string(), Value::from(disposed));
        if let Err(e) = inner.notifier.emit("factory_shutdown", payload) {
            warn!("Failed to publish shutdown event: {}", e);
        }

        info!("Execution engine factory shut down ({} units disposed)", disposed);
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.inner.registry.lock().await.snapshot(&self.inner.config)
    }

    /// Registered units across all tenants
    pub async fn active_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Units currently counted against the tenant's limit
    pub async fn active_for_tenant(&self, tenant_id: &str) -> usize {
        self.inner.registry.lock().await.live_for_tenant(tenant_id)
    }

    pub async fn handles_for_tenant(&self, tenant_id: &str) -> Vec<EngineHandle<B::Unit>> {
        self.inner.registry.lock().await.handles_for_tenant(tenant_id)
    }

    /// When the reaper last saw this unit alive
    pub async fn last_active(&self, handle: &EngineHandle<B::Unit>) -> Option<DateTime<Utc>> {
        self.inner.registry.lock().await.last_active_at(handle.key())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Run one reaper pass now instead of waiting for the next tick
    pub async fn reap_now(&self) -> ReapSummary {
        self.inner.reap().await
    }

    fn ensure_reaper(&self) {
        if self.inner.is_shut_down() {
            return;
        }

        let mut slot = self.inner.reaper.lock();
        if slot.is_none() {
            debug!(
                "Starting reaper (interval {:?})",
                self.inner.config.cleanup_interval
            );
            *slot = Some(reaper::spawn(
                Arc::downgrade(&self.inner),
                self.inner.config.cleanup_interval,
                self.inner.cancel.clone(),
            ));
        }
    }
}

impl<B: UnitBuilder> std::fmt::Debug for ExecutionEngineFactory<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngineFactory")
            .field("config", &self.inner.config)
            .field("shut_down", &self.inner.is_shut_down())
            .finish()
    }
}
