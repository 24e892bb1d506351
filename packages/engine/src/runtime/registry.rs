// packages/engine/src/runtime/registry.rs
//! Unit registry and factory counters
//!
//! The registry is only ever touched while the factory holds its lock, so
//! nothing in here synchronizes on its own. Removal is two-phase: an entry
//! is first *claimed* (flagged as disposing, which makes it invisible to
//! admission and to other claimers) and later *finished* once its dispose
//! hook has returned. A unit is therefore disposed at most once no matter
//! how cleanup, the reaper and shutdown interleave.
//!
//! ```text
//!  insert ──► live ──claim──► disposing ──finish──► removed (cleaned += 1)
//!              │                                   ▲
//!              └──────────── clear (shutdown) ─────┘
//! ```

use crate::observability::names;
use crate::runtime::factory::FactoryConfig;
use crate::runtime::unit::{EngineHandle, ExecutionUnit, UnitKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Why a unit left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Caller asked for it (`cleanup` / `cleanup_user`)
    Explicit,
    /// The unit reported itself inactive
    Inactive,
    /// Older than the configured timeout
    TimedOut,
    /// Factory shutdown
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Inactive => "inactive",
            Self::TimedOut => "timed_out",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Cumulative factory counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryMetrics {
    pub total_created: u64,
    pub total_cleaned: u64,
    pub creation_errors: u64,
    pub tenant_limit_rejections: u64,
    pub timeout_evictions: u64,
    pub disposal_errors: u64,
}

/// Point-in-time factory metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_created: u64,
    pub total_cleaned: u64,
    pub creation_errors: u64,
    pub tenant_limit_rejections: u64,
    pub timeout_evictions: u64,
    pub disposal_errors: u64,
    pub active_count: usize,
    pub max_engines_per_tenant: usize,
    pub timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

struct UnitEntry<U> {
    handle: EngineHandle<U>,
    last_active_at: DateTime<Utc>,
    disposing: bool,
}

pub(crate) struct UnitRegistry<U> {
    entries: HashMap<UnitKey, UnitEntry<U>>,
    metrics: FactoryMetrics,
}

impl<U: ExecutionUnit> UnitRegistry<U> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            metrics: FactoryMetrics::default(),
        }
    }

    /// Entries including ones mid-disposal
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_key(&self, key: &UnitKey) -> bool {
        self.entries.contains_key(key)
    }

    /// A run id may only be registered once per tenant while its unit is alive
    pub fn contains_run(&self, tenant_id: &str, run_id: &str) -> bool {
        self.entries.values().any(|entry| {
            !entry.disposing
                && entry.handle.tenant_id() == tenant_id
                && entry.handle.run_id() == run_id
        })
    }

    /// Units counted against the tenant limit
    pub fn live_for_tenant(&self, tenant_id: &str) -> usize {
        self.entries
            .values()
            .filter(|entry| {
                !entry.disposing
                    && entry.handle.tenant_id() == tenant_id
                    && entry.handle.unit().is_active()
            })
            .count()
    }

    /// Registered (not disposing) handles for a tenant, oldest first
    pub fn handles_for_tenant(&self, tenant_id: &str) -> Vec<EngineHandle<U>> {
        let mut handles: Vec<_> = self
            .entries
            .values()
            .filter(|entry| !entry.disposing && entry.handle.tenant_id() == tenant_id)
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.key().cmp(b.key())));
        handles
    }

    pub fn insert(&mut self, handle: EngineHandle<U>) {
        let key = handle.key().clone();
        let now = Utc::now();
        self.entries.insert(
            key,
            UnitEntry {
                handle,
                last_active_at: now,
                disposing: false,
            },
        );
        self.metrics.total_created += 1;
        metrics::counter!(names::UNITS_CREATED).increment(1);
        self.publish_gauge();
    }

    pub fn record_creation_error(&mut self) {
        self.metrics.creation_errors += 1;
        metrics::counter!(names::CREATION_ERRORS).increment(1);
    }

    pub fn record_limit_rejection(&mut self) {
        self.metrics.tenant_limit_rejections += 1;
        metrics::counter!(names::TENANT_LIMIT_REJECTIONS).increment(1);
    }

    /// Claim one entry for disposal; `None` if absent or already claimed
    pub fn claim(&mut self, key: &UnitKey) -> Option<EngineHandle<U>> {
        let entry = self.entries.get_mut(key)?;
        if entry.disposing {
            return None;
        }
        entry.disposing = true;
        Some(entry.handle.clone())
    }

    pub fn claim_tenant(&mut self, tenant_id: &str) -> Vec<EngineHandle<U>> {
        self.entries
            .values_mut()
            .filter(|entry| !entry.disposing && entry.handle.tenant_id() == tenant_id)
            .map(|entry| {
                entry.disposing = true;
                entry.handle.clone()
            })
            .collect()
    }

    pub fn claim_all(&mut self) -> Vec<EngineHandle<U>> {
        self.entries
            .values_mut()
            .filter(|entry| !entry.disposing)
            .map(|entry| {
                entry.disposing = true;
                entry.handle.clone()
            })
            .collect()
    }

    /// Claim inactive and over-age units; refresh `last_active_at` on the rest
    pub fn claim_expired(
        &mut self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Vec<(EngineHandle<U>, EvictionReason)> {
        let mut expired = Vec::new();

        for entry in self.entries.values_mut().filter(|entry| !entry.disposing) {
            let unit = entry.handle.unit();
            let reason = if !unit.is_active() {
                Some(EvictionReason::Inactive)
            } else if age(now, unit.created_at()) > ttl {
                Some(EvictionReason::TimedOut)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    entry.disposing = true;
                    expired.push((entry.handle.clone(), reason));
                }
                None => entry.last_active_at = now,
            }
        }

        expired
    }

    /// Remove a claimed entry after disposal. Returns false if it was
    /// already gone (cleared by shutdown).
    pub fn finish(&mut self, key: &UnitKey, reason: EvictionReason, disposal_failed: bool) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }

        self.metrics.total_cleaned += 1;
        metrics::counter!(names::UNITS_CLEANED, "reason" => reason.as_str()).increment(1);

        if reason == EvictionReason::TimedOut {
            self.metrics.timeout_evictions += 1;
            metrics::counter!(names::TIMEOUT_EVICTIONS).increment(1);
        }
        if disposal_failed {
            self.metrics.disposal_errors += 1;
            metrics::counter!(names::DISPOSAL_ERRORS).increment(1);
        }

        self.publish_gauge();
        true
    }

    /// Drop every remaining entry, counting each as cleaned
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.metrics.total_cleaned += removed as u64;
        metrics::counter!(names::UNITS_CLEANED, "reason" => EvictionReason::Shutdown.as_str())
            .increment(removed as u64);
        self.publish_gauge();
        removed
    }

    pub fn last_active_at(&self, key: &UnitKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|entry| entry.last_active_at)
    }

    pub fn snapshot(&self, config: &FactoryConfig) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            total_created: m.total_created,
            total_cleaned: m.total_cleaned,
            creation_errors: m.creation_errors,
            tenant_limit_rejections: m.tenant_limit_rejections,
            timeout_evictions: m.timeout_evictions,
            disposal_errors: m.disposal_errors,
            active_count: self.entries.len(),
            max_engines_per_tenant: config.max_engines_per_tenant,
            timeout_seconds: config.unit_timeout.as_secs(),
            cleanup_interval_seconds: config.cleanup_interval.as_secs(),
        }
    }

    fn publish_gauge(&self) {
        metrics::gauge!(names::ACTIVE_UNITS).set(self.entries.len() as f64);
    }
}

/// Age of a unit; clock skew into the future counts as zero
fn age(now: DateTime<Utc>, created_at: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tenant::TenantContext;
    use crate::utils::errors::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeUnit {
        active: AtomicBool,
        created_at: DateTime<Utc>,
    }

    #[async_trait]
    impl ExecutionUnit for FakeUnit {
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.created_at
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    fn handle(tenant: &str, run: &str, created_at: DateTime<Utc>) -> EngineHandle<FakeUnit> {
        let ctx = TenantContext::new(tenant).with_run_id(run);
        let unit = FakeUnit {
            active: AtomicBool::new(true),
            created_at,
        };
        EngineHandle::new(UnitKey::new(tenant, run, created_at), &ctx, created_at, Arc::new(unit))
    }

    #[test]
    fn test_claim_is_exactly_once() {
        let mut registry = UnitRegistry::new();
        let h = handle("u1", "r1", Utc::now());
        registry.insert(h.clone());

        assert!(registry.claim(h.key()).is_some());
        assert!(registry.claim(h.key()).is_none());
        assert!(registry.claim_all().is_empty());

        assert!(registry.finish(h.key(), EvictionReason::Explicit, false));
        assert!(!registry.finish(h.key(), EvictionReason::Explicit, false));

        let snapshot = registry.snapshot(&FactoryConfig::default());
        assert_eq!(snapshot.total_created, 1);
        assert_eq!(snapshot.total_cleaned, 1);
        assert_eq!(snapshot.active_count, 0);
    }

    #[test]
    fn test_live_count_skips_inactive_and_disposing() {
        let mut registry = UnitRegistry::new();
        let now = Utc::now();
        let a = handle("u1", "a", now);
        let b = handle("u1", "b", now);
        let c = handle("u1", "c", now);
        let other = handle("u2", "a", now);
        for h in [&a, &b, &c, &other] {
            registry.insert(h.clone());
        }
        assert_eq!(registry.live_for_tenant("u1"), 3);

        b.unit().active.store(false, Ordering::SeqCst);
        registry.claim(c.key());
        assert_eq!(registry.live_for_tenant("u1"), 1);
        assert_eq!(registry.handles_for_tenant("u1").len(), 2);
        assert!(registry.contains_run("u1", "a"));
        assert!(!registry.contains_run("u1", "c"));
    }

    #[test]
    fn test_claim_expired_reasons() {
        let mut registry = UnitRegistry::new();
        let now = Utc::now();
        let fresh = handle("u1", "fresh", now);
        let old = handle("u1", "old", now - chrono::Duration::seconds(120));
        let idle = handle("u1", "idle", now);
        idle.unit().active.store(false, Ordering::SeqCst);
        for h in [&fresh, &old, &idle] {
            registry.insert(h.clone());
        }

        let mut expired = registry.claim_expired(now, Duration::from_secs(60));
        expired.sort_by(|a, b| a.0.run_id().cmp(b.0.run_id()));
        let reasons: Vec<_> = expired.iter().map(|(h, r)| (h.run_id().to_string(), *r)).collect();
        assert_eq!(
            reasons,
            vec![
                ("idle".to_string(), EvictionReason::Inactive),
                ("old".to_string(), EvictionReason::TimedOut),
            ]
        );
        assert_eq!(registry.last_active_at(fresh.key()), Some(now));

        for (h, reason) in expired {
            registry.finish(h.key(), reason, false);
        }
        let snapshot = registry.snapshot(&FactoryConfig::default());
        assert_eq!(snapshot.timeout_evictions, 1);
        assert_eq!(snapshot.total_cleaned, 2);
        assert_eq!(snapshot.active_count, 1);
    }

    #[test]
    fn test_clear_counts_as_cleaned() {
        let mut registry = UnitRegistry::new();
        let now = Utc::now();
        registry.insert(handle("u1", "a", now));
        registry.insert(handle("u2", "b", now));
        registry.record_creation_error();

        assert_eq!(registry.clear(), 2);
        let snapshot = registry.snapshot(&FactoryConfig::default());
        assert_eq!(snapshot.total_created - snapshot.total_cleaned, 0);
        assert_eq!(snapshot.creation_errors, 1);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let registry: UnitRegistry<FakeUnit> = UnitRegistry::new();
        let json = serde_json::to_value(registry.snapshot(&FactoryConfig::default())).unwrap();
        assert_eq!(json["maxEnginesPerTenant"], 3);
        assert_eq!(json["timeoutSeconds"], 1800);
        assert_eq!(json["cleanupIntervalSeconds"], 60);
    }
}
