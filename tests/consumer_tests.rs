use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tradevol::assets::StaticAssetResolver;
use tradevol::buckets::{hour_floor, HOUR_MS};
use tradevol::config::Config;
use tradevol::consumer::{
    inbound_channel, BatchConsumer, BatchOutcome, InboundSender, RetryPolicy,
};
use tradevol::engine::Engine;
use tradevol::error::{VolumeError, VolumeResult};
use tradevol::feed::run_file_feed;
use tradevol::graceful_shutdown;
use tradevol::lifecycle::Service;
use tradevol::types::{now_ms, TradeBatch, TradeEvent};
use tradevol::volume_store::{MemoryBackend, RowKey, StoreBackend, SubjectFilter, VolumeRow};

/// Memory backend whose writes fail until `failures` runs out.
struct FlakyBackend {
    inner: MemoryBackend,
    failures: AtomicU32,
}

impl FlakyBackend {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryBackend::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl StoreBackend for FlakyBackend {
    async fn table_exists(&self, table: &str) -> VolumeResult<bool> {
        self.inner.table_exists(table).await
    }

    async fn upsert(&self, table: &str, row: VolumeRow) -> VolumeResult<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(VolumeError::storage("connection reset"));
        }
        self.inner.upsert(table, row).await
    }

    async fn get(&self, table: &str, key: &RowKey) -> VolumeResult<Option<VolumeRow>> {
        self.inner.get(table, key).await
    }

    async fn scan_hour(
        &self,
        table: &str,
        hour_ms: u64,
        subject: &SubjectFilter,
    ) -> VolumeResult<Vec<VolumeRow>> {
        self.inner.scan_hour(table, hour_ms, subject).await
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "tradevol_consumer_{}_{}_{}",
        std::process::id(),
        now_ms(),
        name
    ))
}

fn event(trade: &str, asset: &str, ts_ms: u64) -> TradeEvent {
    TradeEvent {
        trade_id: trade.to_string(),
        user_id: "u".to_string(),
        wallet_id: "w".to_string(),
        asset_id: asset.to_string(),
        volume: 1.0,
        opposite_asset_id: "USD".to_string(),
        opposite_volume: Some(2.0),
        ts_ms,
        hidden: false,
    }
}

fn batch(id: &str, events: Vec<TradeEvent>) -> TradeBatch {
    TradeBatch {
        batch_id: id.to_string(),
        events,
    }
}

struct Harness {
    engine: Engine,
    consumer: BatchConsumer,
    inbound: InboundSender,
    dead_letter: PathBuf,
}

fn harness(backend: Arc<dyn StoreBackend>, policy: RetryPolicy) -> Harness {
    let engine = Engine::new(
        &Config::default(),
        backend,
        Arc::new(StaticAssetResolver::new()),
    );
    let (inbound, rx) = inbound_channel(8);
    let dead_letter = temp_path("dead_letter.jsonl");
    let consumer = BatchConsumer::new(
        engine.aggregator.clone(),
        rx,
        policy,
        dead_letter.clone(),
        engine.health.clone(),
    );
    Harness {
        engine,
        consumer,
        inbound,
        dead_letter,
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let policy = RetryPolicy {
        delay: Duration::from_millis(5),
        window: Duration::from_secs(5),
    };
    let mut h = harness(Arc::new(FlakyBackend::new(3)), policy);
    h.consumer.start().await.expect("start");

    let ts = hour_floor(now_ms()) - HOUR_MS;
    let outcome = h
        .inbound
        .submit(batch("b1", vec![event("t1", "BTC", ts)]))
        .await
        .expect("submit");
    assert!(matches!(outcome, BatchOutcome::Ingested(_)));

    let snap = h.engine.health.snapshot();
    assert_eq!(snap.batch_retries, 3);
    assert_eq!(snap.batches_ingested, 1);
    assert_eq!(snap.batches_dead_lettered, 0);
    assert_eq!(h.engine.aggregator.watermark(), Some(ts));

    h.consumer.stop().await.expect("stop");
    assert!(!h.dead_letter.exists());
}

#[tokio::test]
async fn persistent_failure_is_dead_lettered_after_the_window() {
    let policy = RetryPolicy {
        delay: Duration::from_millis(10),
        window: Duration::from_millis(40),
    };
    let mut h = harness(Arc::new(FlakyBackend::new(u32::MAX)), policy);
    h.consumer.start().await.expect("start");

    let outcome = h
        .inbound
        .submit(batch("b-dead", vec![event("t1", "BTC", 1_000)]))
        .await
        .expect("submit");
    match outcome {
        BatchOutcome::DeadLettered { attempts, error } => {
            assert!(attempts >= 2, "attempts={attempts}");
            assert!(error.contains("connection reset"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.engine.aggregator.watermark(), None);

    h.consumer.stop().await.expect("stop");
    let raw = std::fs::read_to_string(&h.dead_letter).expect("dead letter file");
    let line: serde_json::Value =
        serde_json::from_str(raw.lines().next().expect("line")).expect("json");
    assert_eq!(line["batch_id"], "b-dead");
    assert_eq!(line["batch"]["events"][0]["trade_id"], "t1");
    let _ = std::fs::remove_file(&h.dead_letter);
}

#[tokio::test]
async fn rejected_batch_is_dead_lettered_without_retry() {
    let policy = RetryPolicy {
        delay: Duration::from_millis(5),
        window: Duration::from_secs(5),
    };
    let mut h = harness(Arc::new(MemoryBackend::new()), policy);
    h.consumer.start().await.expect("start");

    // Too long for a table name and no alias registered.
    let long_asset = "X".repeat(64);
    let outcome = h
        .inbound
        .submit(batch("b-long", vec![event("t1", &long_asset, 1_000)]))
        .await
        .expect("submit");
    assert_eq!(
        outcome,
        BatchOutcome::DeadLettered {
            attempts: 1,
            error: format!("unknown asset: {long_asset}"),
        }
    );
    assert_eq!(h.engine.health.snapshot().batch_retries, 0);

    h.consumer.stop().await.expect("stop");
    let _ = std::fs::remove_file(&h.dead_letter);
}

#[tokio::test]
async fn file_feed_waits_for_each_ack() {
    let policy = RetryPolicy {
        delay: Duration::from_millis(5),
        window: Duration::from_millis(5),
    };
    let mut h = harness(Arc::new(MemoryBackend::new()), policy);
    h.consumer.start().await.expect("start");

    let ts = hour_floor(now_ms()) - 2 * HOUR_MS;
    let input = temp_path("batches.jsonl");
    let lines = [
        serde_json::to_string(&batch("b1", vec![event("t1", "BTC", ts)])).expect("json"),
        "{not json".to_string(),
        String::new(),
        serde_json::to_string(&batch("b2", vec![event("t2", "ETH", ts + HOUR_MS)]))
            .expect("json"),
    ];
    std::fs::write(&input, lines.join("\n")).expect("write input");

    let (_tx, rx) = graceful_shutdown::channel();
    let stats = run_file_feed(&input, h.inbound.clone(), rx)
        .await
        .expect("feed");
    assert_eq!(stats.ingested, 2);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(h.engine.aggregator.watermark(), Some(ts + HOUR_MS));

    drop(h.inbound);
    h.consumer.join().await.expect("consumer drains and exits");
    let _ = std::fs::remove_file(&input);
}
