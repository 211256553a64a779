use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::graceful_shutdown::{self, ShutdownRx, ShutdownTx};
use crate::lifecycle::Service;
use crate::recorder::JsonlAppender;
use crate::types::now_ms;

#[derive(Default)]
pub struct HealthCounters {
    batches_ingested: AtomicU64,
    events_ingested: AtomicU64,
    duplicate_user_legs: AtomicU64,
    snapshots_written: AtomicU64,
    batch_retries: AtomicU64,
    batches_dead_lettered: AtomicU64,
    stale_warnings: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_windows_evicted: AtomicU64,
    last_ingest_ms: AtomicU64,
    watermark_ms: AtomicU64,
}

impl HealthCounters {
    pub fn inc_batches_ingested(&self, n: u64) {
        self.batches_ingested.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_events_ingested(&self, n: u64) {
        self.events_ingested.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_duplicate_user_legs(&self, n: u64) {
        self.duplicate_user_legs.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_snapshots_written(&self, n: u64) {
        self.snapshots_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_batch_retries(&self, n: u64) {
        self.batch_retries.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_batches_dead_lettered(&self, n: u64) {
        self.batches_dead_lettered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_stale_warnings(&self, n: u64) {
        self.stale_warnings.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self, n: u64) {
        self.cache_misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_cache_windows_evicted(&self, n: u64) {
        self.cache_windows_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_last_ingest_ms(&self, ts_ms: u64) {
        self.last_ingest_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn set_watermark_ms(&self, ts_ms: u64) {
        self.watermark_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            ts_ms: now_ms(),
            batches_ingested: self.batches_ingested.load(Ordering::Relaxed),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            duplicate_user_legs: self.duplicate_user_legs.load(Ordering::Relaxed),
            snapshots_written: self.snapshots_written.load(Ordering::Relaxed),
            batch_retries: self.batch_retries.load(Ordering::Relaxed),
            batches_dead_lettered: self.batches_dead_lettered.load(Ordering::Relaxed),
            stale_warnings: self.stale_warnings.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_windows_evicted: self.cache_windows_evicted.load(Ordering::Relaxed),
            last_ingest_ms: self.last_ingest_ms.load(Ordering::Relaxed),
            watermark_ms: self.watermark_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthLine {
    Heartbeat(HealthSnapshot),
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub ts_ms: u64,
    pub batches_ingested: u64,
    pub events_ingested: u64,
    pub duplicate_user_legs: u64,
    pub snapshots_written: u64,
    pub batch_retries: u64,
    pub batches_dead_lettered: u64,
    pub stale_warnings: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_windows_evicted: u64,
    pub last_ingest_ms: u64,
    pub watermark_ms: u64,
}

/// Appends a heartbeat line to `path` every `interval` until shutdown, then a final one.
pub fn spawn_health_writer(
    path: PathBuf,
    counters: Arc<HealthCounters>,
    interval: Duration,
    mut shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut out = match JsonlAppender::open(&path) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "open health.jsonl failed");
                return;
            }
        };

        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = graceful_shutdown::requested(&mut shutdown) => break,
                _ = tick.tick() => {
                    let line = HealthLine::Heartbeat(counters.snapshot());
                    if let Err(e) = out.write_json(&line) {
                        warn!(error = %e, "health heartbeat write failed");
                    }
                }
            }
        }

        let line = HealthLine::Heartbeat(counters.snapshot());
        if let Err(e) = out.write_json(&line) {
            warn!(error = %e, "final health heartbeat write failed");
        }
        if let Err(e) = out.flush_and_sync() {
            warn!(error = %e, "health.jsonl flush/sync failed");
        }
    })
}

/// Heartbeat writer as a lifecycle service.
pub struct HealthService {
    path: PathBuf,
    counters: Arc<HealthCounters>,
    interval: Duration,
    shutdown: Option<ShutdownTx>,
    handle: Option<JoinHandle<()>>,
}

impl HealthService {
    pub fn new(path: PathBuf, counters: Arc<HealthCounters>, interval: Duration) -> Self {
        Self {
            path,
            counters,
            interval,
            shutdown: None,
            handle: None,
        }
    }
}

#[async_trait]
impl Service for HealthService {
    fn name(&self) -> &'static str {
        "health_heartbeat"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let (tx, rx) = graceful_shutdown::channel();
        self.handle = Some(spawn_health_writer(
            self.path.clone(),
            self.counters.clone(),
            self.interval,
            rx,
        ));
        self.shutdown = Some(tx);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            graceful_shutdown::request(&tx);
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| anyhow::anyhow!("health writer join failed: {e}"))?;
        }
        Ok(())
    }
}
