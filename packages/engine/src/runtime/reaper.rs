// packages/engine/src/runtime/reaper.rs
//! Background eviction loop
//!
//! One reaper per factory, started lazily on the first successful creation.
//! It only holds a weak reference, so dropping every factory clone ends it
//! as well as `shutdown` does.

use crate::runtime::factory::FactoryInner;
use crate::runtime::unit::UnitBuilder;
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Units evicted by one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapSummary {
    pub inactive: usize,
    pub timed_out: usize,
}

impl ReapSummary {
    pub fn total(&self) -> usize {
        self.inactive + self.timed_out
    }
}

pub(crate) fn spawn<B: UnitBuilder>(
    inner: Weak<FactoryInner<B>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Reaper cancelled");
                    break;
                }

                _ = ticker.tick() => {}
            }

            let Some(factory) = inner.upgrade() else {
                debug!("Factory dropped, reaper exiting");
                break;
            };

            let summary = factory.reap().await;
            trace!("Reaper pass complete: {:?}", summary);
        }
    })
}
