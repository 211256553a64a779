use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::Evictable;
use crate::graceful_shutdown::{self, ShutdownTx};
use crate::health::HealthCounters;
use crate::lifecycle::Service;

/// Sweeps every cache once; returns the number of windows removed.
pub fn run_eviction_pass(caches: &[Arc<dyn Evictable>], health: &HealthCounters) -> usize {
    let mut total = 0usize;
    for cache in caches {
        let removed = cache.evict_expired();
        if removed > 0 {
            debug!(cache = cache.name(), removed, "cache eviction pass");
        }
        total += removed;
    }
    health.inc_cache_windows_evicted(total as u64);
    total
}

/// Periodic cache eviction on its own task.
pub struct EvictionService {
    caches: Vec<Arc<dyn Evictable>>,
    interval: Duration,
    health: Arc<HealthCounters>,
    shutdown: Option<ShutdownTx>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionService {
    pub fn new(
        caches: Vec<Arc<dyn Evictable>>,
        interval: Duration,
        health: Arc<HealthCounters>,
    ) -> Self {
        Self {
            caches,
            interval,
            health,
            shutdown: None,
            handle: None,
        }
    }
}

#[async_trait]
impl Service for EvictionService {
    fn name(&self) -> &'static str {
        "cache_eviction"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let (tx, mut rx) = graceful_shutdown::channel();
        let caches = self.caches.clone();
        let health = self.health.clone();
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // The first tick completes immediately; nothing can be expired yet.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = graceful_shutdown::requested(&mut rx) => break,
                    _ = tick.tick() => {
                        run_eviction_pass(&caches, &health);
                    }
                }
            }
        }));
        self.shutdown = Some(tx);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            graceful_shutdown::request(&tx);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "eviction task join failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::HOUR_MS;
    use crate::cache::AssetVolumeCache;
    use crate::types::now_ms;

    #[test]
    fn pass_sums_removed_windows_across_caches() {
        let a = Arc::new(AssetVolumeCache::new("a", HOUR_MS, 1_000));
        let b = Arc::new(AssetVolumeCache::new("b", HOUR_MS, 1_000));
        let now = now_ms();
        let from = now - HOUR_MS / 2;
        a.store_at(now, "c", "X", from, from + HOUR_MS, 1.0);
        b.store_at(now, "c", "X", from, from + HOUR_MS, 1.0);
        // Nothing is old enough yet.
        let health = HealthCounters::default();
        let caches: Vec<Arc<dyn Evictable>> = vec![a.clone(), b.clone()];
        assert_eq!(run_eviction_pass(&caches, &health), 0);

        assert_eq!(a.evict_expired_at(now + 2 * HOUR_MS), 1);
        assert_eq!(b.window_count(), 1);
    }

    #[tokio::test]
    async fn service_stops_on_request() {
        let mut svc = EvictionService::new(
            Vec::new(),
            Duration::from_millis(5),
            Arc::new(HealthCounters::default()),
        );
        svc.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(20)).await;
        svc.stop().await.expect("stop");
        assert!(svc.handle.is_none());
        // Stopping twice is fine.
        svc.stop().await.expect("stop again");
    }
}
