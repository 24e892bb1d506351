// packages/engine/tests/factory_lifecycle.rs
//! End-to-end factory behavior under concurrency

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenant_engine::runtime::{
    ChannelNotifier, EngineHandle, ExecutionEngineFactory, ExecutionUnit, FactoryConfig,
    TaskContext, TaskUnitBuilder, TenantContext, UnitBuilder, UnitEmitter,
};
use tenant_engine::{EngineError, Result};

struct CountingUnit {
    id: usize,
    active: AtomicBool,
    created_at: DateTime<Utc>,
    disposals: Arc<parking_lot::Mutex<HashMap<usize, usize>>>,
}

#[async_trait]
impl ExecutionUnit for CountingUnit {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    async fn dispose(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self.disposals.lock().entry(self.id).or_insert(0) += 1;
        Ok(())
    }
}

#[derive(Default)]
struct CountingBuilder {
    next_id: AtomicUsize,
    disposals: Arc<parking_lot::Mutex<HashMap<usize, usize>>>,
}

#[async_trait]
impl UnitBuilder for CountingBuilder {
    type Unit = CountingUnit;

    async fn build(&self, _ctx: &TenantContext, _emitter: UnitEmitter) -> Result<CountingUnit> {
        // Yield so concurrent creators really interleave
        tokio::task::yield_now().await;
        Ok(CountingUnit {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            active: AtomicBool::new(true),
            created_at: Utc::now(),
            disposals: Arc::clone(&self.disposals),
        })
    }
}

fn config(max: usize) -> FactoryConfig {
    FactoryConfig {
        max_engines_per_tenant: max,
        cleanup_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(1),
        dispose_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_never_exceed_limit() {
    let factory = ExecutionEngineFactory::new(config(3), CountingBuilder::default()).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..24 {
        let factory = factory.clone();
        tasks.push(tokio::spawn(async move {
            factory.create_for_user(TenantContext::new("u1")).await
        }));
    }

    let mut created = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(EngineError::TenantLimitExceeded { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(created, 3);
    assert_eq!(rejected, 21);
    assert_eq!(factory.active_for_tenant("u1").await, 3);

    let metrics = factory.metrics().await;
    assert_eq!(metrics.tenant_limit_rejections, 21);
    assert_eq!(metrics.total_created, 3);

    factory.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_cleanups_dispose_exactly_once() {
    let builder = CountingBuilder::default();
    let disposals = Arc::clone(&builder.disposals);
    let factory = ExecutionEngineFactory::new(config(5), builder).unwrap();

    let mut handles: Vec<EngineHandle<CountingUnit>> = Vec::new();
    for tenant in ["u1", "u2"] {
        for _ in 0..5 {
            handles.push(factory.create_for_user(TenantContext::new(tenant)).await.unwrap());
        }
    }
    // Half of them also look dead to the reaper
    for handle in handles.iter().step_by(2) {
        handle.unit().active.store(false, Ordering::SeqCst);
    }

    let mut tasks = Vec::new();
    for handle in handles.iter().cloned() {
        let factory = factory.clone();
        tasks.push(tokio::spawn(async move {
            factory.cleanup(&handle).await;
        }));
    }
    for tenant in ["u1", "u2"] {
        let factory = factory.clone();
        tasks.push(tokio::spawn(async move {
            factory.cleanup_user(tenant).await;
        }));
    }
    {
        let factory = factory.clone();
        tasks.push(tokio::spawn(async move {
            factory.reap_now().await;
        }));
    }
    {
        let factory = factory.clone();
        tasks.push(tokio::spawn(async move {
            factory.shutdown().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let disposals = disposals.lock();
    assert_eq!(disposals.len(), 10);
    assert!(disposals.values().all(|count| *count == 1));

    let metrics = factory.metrics().await;
    assert_eq!(metrics.active_count, 0);
    assert_eq!(metrics.total_created, 10);
    assert_eq!(metrics.total_cleaned, 10);
}

#[tokio::test]
async fn test_active_count_tracks_created_minus_cleaned() {
    let factory = ExecutionEngineFactory::new(config(2), CountingBuilder::default()).unwrap();

    let a = factory.create_for_user(TenantContext::new("u1")).await.unwrap();
    let _b = factory.create_for_user(TenantContext::new("u1")).await.unwrap();
    let _ = factory.create_for_user(TenantContext::new("u1")).await;
    let _c = factory.create_for_user(TenantContext::new("u2")).await.unwrap();
    factory.cleanup(&a).await;
    let _ = factory.create_for_user(TenantContext::new("")).await;

    let metrics = factory.metrics().await;
    assert_eq!(
        metrics.active_count as u64,
        metrics.total_created - metrics.total_cleaned
    );
    assert_eq!(metrics.active_count, 2);
    assert_eq!(metrics.creation_errors, 1);
    assert_eq!(metrics.tenant_limit_rejections, 1);

    factory.shutdown().await;
    let metrics = factory.metrics().await;
    assert_eq!(metrics.active_count, 0);
    assert_eq!(metrics.total_created, metrics.total_cleaned);
}

#[tokio::test]
async fn test_task_units_end_to_end() {
    let (notifier, mut events) = ChannelNotifier::new(128);
    let builder = TaskUnitBuilder::new(|task: TaskContext| async move {
        let steps = task
            .tenant
            .auxiliary
            .get("steps")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        for step in 0..steps {
            task.emitter.emit_value("progress", serde_json::json!({ "step": step }));
        }
        task.cancel.cancelled().await;
        Ok::<(), EngineError>(())
    });

    let factory = ExecutionEngineFactory::with_notifier(
        FactoryConfig {
            cleanup_interval: Duration::from_millis(50),
            ..config(2)
        },
        builder,
        Arc::new(notifier),
    )
    .unwrap();

    let handle = factory
        .create_for_user(TenantContext::new("acme").with_aux("steps", serde_json::json!(2)))
        .await
        .unwrap();
    assert!(handle.unit().is_active());

    tokio::time::sleep(Duration::from_millis(150)).await;
    // Still running, so the reaper keeps it
    assert_eq!(factory.active_count().await, 1);

    assert!(factory.cleanup_user("acme").await);
    assert!(!handle.unit().is_active());

    factory.shutdown().await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind != "factory_shutdown" {
            assert_eq!(event.payload["tenant_id"], "acme");
        }
        kinds.push(event.kind);
    }
    assert!(kinds.iter().any(|k| k == "unit_created"));
    assert_eq!(kinds.iter().filter(|k| *k == "progress").count(), 2);
    assert!(kinds.iter().any(|k| k == "unit_cleaned"));
}

#[tokio::test]
async fn test_dropping_factory_stops_reaper() {
    let factory = ExecutionEngineFactory::new(
        FactoryConfig {
            cleanup_interval: Duration::from_millis(10),
            ..config(1)
        },
        CountingBuilder::default(),
    )
    .unwrap();

    let handle = factory.create_for_user(TenantContext::new("u1")).await.unwrap();
    factory.cleanup(&handle).await;
    drop(factory);

    // Reaper observes the dropped factory and exits without panicking
    tokio::time::sleep(Duration::from_millis(50)).await;
}
