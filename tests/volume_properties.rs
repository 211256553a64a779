use std::sync::Arc;
use std::time::Duration;

use assert_approx_eq::assert_approx_eq;
use async_trait::async_trait;

use tradevol::assets::StaticAssetResolver;
use tradevol::buckets::{hour_floor, HOUR_MS};
use tradevol::config::{AssetPairDef, Config};
use tradevol::engine::Engine;
use tradevol::types::{now_ms, ClientSelector, SubjectKind, TradeBatch, TradeEvent};
use tradevol::error::VolumeResult;
use tradevol::volume_store::{MemoryBackend, RowKey, StoreBackend, SubjectFilter, VolumeRow};

/// Memory backend whose hour scans return their rows only after a pause.
struct SlowScanBackend {
    inner: MemoryBackend,
    pause: Duration,
}

#[async_trait]
impl StoreBackend for SlowScanBackend {
    async fn table_exists(&self, table: &str) -> VolumeResult<bool> {
        self.inner.table_exists(table).await
    }

    async fn upsert(&self, table: &str, row: VolumeRow) -> VolumeResult<()> {
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
        let rows = self.inner.scan_hour(table, hour_ms, subject).await?;
        tokio::time::sleep(self.pause).await;
        Ok(rows)
    }
}

fn engine_with(backend: Arc<dyn StoreBackend>) -> Engine {
    let mut resolver = StaticAssetResolver::new();
    resolver.add_pair(&AssetPairDef {
        id: "AB".to_string(),
        base: "A".to_string(),
        quote: "B".to_string(),
    });
    Engine::new(&Config::default(), backend, Arc::new(resolver))
}

fn engine() -> Engine {
    engine_with(Arc::new(MemoryBackend::new()))
}

fn leg(
    trade: &str,
    user: &str,
    wallet: &str,
    volume: f64,
    opposite: f64,
    ts_ms: u64,
) -> TradeEvent {
    TradeEvent {
        trade_id: trade.to_string(),
        user_id: user.to_string(),
        wallet_id: wallet.to_string(),
        asset_id: "A".to_string(),
        volume,
        opposite_asset_id: "B".to_string(),
        opposite_volume: Some(opposite),
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

/// An hour far enough back to sit below the watermark, but inside cache retention.
fn base_hour() -> u64 {
    hour_floor(now_ms()) - 6 * HOUR_MS
}

fn client(id: &str) -> ClientSelector {
    ClientSelector::Client(id.to_string())
}

fn wallet(id: &str) -> ClientSelector {
    ClientSelector::Wallet(id.to_string())
}

#[tokio::test]
async fn same_trade_from_two_wallets_counts_once_for_the_user() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "u", "w1", 10.0, 5.0, h + 1_000),
                leg("t1", "u", "w2", 10.0, 5.0, h + 2_000),
                leg("t9", "u", "w1", 0.0, 0.0, h + HOUR_MS),
            ],
        ))
        .await
        .expect("ingest");

    let to = h + HOUR_MS;
    let user = e
        .aggregator
        .asset_volume("A", &client("u"), h, to)
        .await
        .expect("user");
    assert_approx_eq!(user, 10.0, 1e-12);

    for w in ["w1", "w2"] {
        let wallet = e
            .aggregator
            .asset_volume("A", &wallet(w), h, to)
            .await
            .expect("wallet");
        assert_approx_eq!(wallet, 10.0, 1e-12);
    }
    assert_eq!(e.health.snapshot().duplicate_user_legs, 1);
}

#[tokio::test]
async fn every_leg_has_a_mirrored_counter_row() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch("b1", vec![leg("t1", "x", "wx", 10.0, 5.0, h + 10)]))
        .await
        .expect("ingest");

    let store = e.aggregator.store();
    for (subject, kind) in [("x", SubjectKind::User), ("wx", SubjectKind::Wallet)] {
        let forward = store
            .read_leg(h, subject, kind, "A", "B")
            .await
            .expect("read");
        let mirrored = store
            .read_leg(h, subject, kind, "B", "A")
            .await
            .expect("read");
        assert_eq!(forward, mirrored.mirrored());
        assert_approx_eq!(forward.volume, 10.0, 1e-12);
        assert_approx_eq!(mirrored.volume, 5.0, 1e-12);
    }
}

#[tokio::test]
async fn wildcard_halves_two_sided_trades() {
    let e = engine();
    let h = base_hour();
    let store = e.aggregator.store();
    store
        .write_both_legs(h, "X", SubjectKind::User, "A", 10.0, "B", 3.0)
        .await
        .expect("write");
    store
        .write_both_legs(h, "Y", SubjectKind::User, "A", 10.0, "B", 3.0)
        .await
        .expect("write");

    let all = store
        .sum_range("A", None, &ClientSelector::All, h, h + HOUR_MS, None)
        .await
        .expect("sum");
    assert_approx_eq!(all, 10.0, 1e-12);
}

#[tokio::test]
async fn queries_never_see_past_the_watermark_hour() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "u", "w", 1.0, 1.0, h + 5),
                leg("t2", "u", "w", 2.0, 1.0, h + 2 * HOUR_MS + 30 * 60_000),
            ],
        ))
        .await
        .expect("ingest");

    let far_future = h + 100 * HOUR_MS;
    let v = e
        .aggregator
        .asset_volume("A", &client("u"), h, far_future)
        .await
        .expect("query");
    // Watermark is inside hour h+2: that hour is not yet visible.
    assert_approx_eq!(v, 1.0, 1e-12);

    let empty = e
        .aggregator
        .asset_volume("A", &client("u"), h + 2 * HOUR_MS, far_future)
        .await
        .expect("query");
    assert_eq!(empty, 0.0);
}

#[tokio::test]
async fn late_trade_updates_cached_window_to_match_recompute() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "u", "w", 7.0, 1.0, h + 1),
                leg("t2", "u", "w", 0.0, 0.0, h + 3 * HOUR_MS),
            ],
        ))
        .await
        .expect("ingest");

    let (from, to) = (h, h + 3 * HOUR_MS);
    let cached = e
        .aggregator
        .asset_volume("A", &client("u"), from, to)
        .await
        .expect("query");
    assert_approx_eq!(cached, 7.0, 1e-12);
    assert_eq!(e.asset_cache.window_count(), 1);

    e.aggregator
        .ingest(&batch("b2", vec![leg("t3", "u", "w", 3.0, 1.0, h + HOUR_MS + 10)]))
        .await
        .expect("ingest");

    let after = e
        .aggregator
        .asset_volume("A", &client("u"), from, to)
        .await
        .expect("query");
    let live = e
        .aggregator
        .store()
        .sum_range("A", None, &client("u"), from, to, None)
        .await
        .expect("sum");
    assert_approx_eq!(after, 10.0, 1e-12);
    assert_approx_eq!(after, live, 1e-9);

    // The counter asset and the pair views of the same client were not cached, so nothing else
    // holds a window.
    assert_eq!(e.pair_cache.window_count(), 0);
}

#[tokio::test]
async fn cached_pair_window_tracks_both_directions() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "u", "w", 4.0, 2.0, h + 1),
                leg("t2", "u", "w", 0.0, 0.0, h + 2 * HOUR_MS),
            ],
        ))
        .await
        .expect("ingest");

    let (from, to) = (h, h + 2 * HOUR_MS);
    let before = e
        .aggregator
        .asset_pair_volume("AB", &client("u"), from, to)
        .await
        .expect("pair");
    assert_approx_eq!(before.base, 4.0, 1e-12);
    assert_approx_eq!(before.quote, 2.0, 1e-12);

    // Same trade direction seen from B: volume of B against A.
    let mut reverse = leg("t3", "u", "w", 1.0, 3.0, h + HOUR_MS);
    reverse.asset_id = "B".to_string();
    reverse.opposite_asset_id = "A".to_string();
    e.aggregator
        .ingest(&batch("b2", vec![reverse]))
        .await
        .expect("ingest");

    let after = e
        .aggregator
        .asset_pair_volume("AB", &client("u"), from, to)
        .await
        .expect("pair");
    assert_approx_eq!(after.base, 7.0, 1e-12);
    assert_approx_eq!(after.quote, 3.0, 1e-12);
    assert_eq!(e.health.snapshot().cache_hits, 1);
}

#[tokio::test]
async fn expired_windows_are_evicted() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "u", "w", 1.0, 1.0, h + 1),
                leg("t2", "u", "w", 0.0, 0.0, h + HOUR_MS),
            ],
        ))
        .await
        .expect("ingest");
    e.aggregator
        .asset_volume("A", &client("u"), h, h + HOUR_MS)
        .await
        .expect("query");
    assert_eq!(e.asset_cache.window_count(), 1);

    let retention_ms = Config::default().cache.retention_ms();
    let removed = e.asset_cache.evict_expired_at(h + retention_ms + 1);
    assert_eq!(removed, 1);
    assert_eq!(e.asset_cache.window_count(), 0);
    assert_eq!(e.asset_cache.client_count(), 0);

    // The next query recomputes from the store.
    let misses = e.health.snapshot().cache_misses;
    let again = e
        .aggregator
        .asset_volume("A", &client("u"), h, h + HOUR_MS)
        .await
        .expect("query");
    let live = e
        .aggregator
        .store()
        .sum_range("A", None, &client("u"), h, h + HOUR_MS, None)
        .await
        .expect("sum");
    assert_approx_eq!(again, live, 1e-9);
    assert_approx_eq!(again, 1.0, 1e-12);
    assert_eq!(e.health.snapshot().cache_misses, misses + 1);
}

#[tokio::test]
async fn user_and_wallet_sharing_an_id_are_counted_apart() {
    let e = engine();
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "x", "x", 10.0, 5.0, h + 1),
                leg("t1", "y", "wy", 10.0, 5.0, h + 2),
                leg("t9", "y", "wy", 0.0, 0.0, h + 3 * HOUR_MS),
            ],
        ))
        .await
        .expect("ingest");

    let to = h + 3 * HOUR_MS;
    let all = e
        .aggregator
        .asset_volume("A", &ClientSelector::All, h, to)
        .await
        .expect("query");
    assert_approx_eq!(all, 10.0, 1e-12);

    let cached = e
        .aggregator
        .asset_volume("A", &client("x"), h, to)
        .await
        .expect("query");
    assert_approx_eq!(cached, 10.0, 1e-12);

    e.aggregator
        .ingest(&batch("b2", vec![leg("t2", "x", "x", 3.0, 1.0, h + HOUR_MS)]))
        .await
        .expect("ingest");

    let after = e
        .aggregator
        .asset_volume("A", &client("x"), h, to)
        .await
        .expect("query");
    let live = e
        .aggregator
        .store()
        .sum_range("A", None, &client("x"), h, to, None)
        .await
        .expect("sum");
    assert_approx_eq!(after, 13.0, 1e-12);
    assert_approx_eq!(after, live, 1e-9);

    let wallet_x = e
        .aggregator
        .asset_volume("A", &wallet("x"), h, to)
        .await
        .expect("query");
    assert_approx_eq!(wallet_x, 13.0, 1e-12);
}

#[tokio::test]
async fn ingest_during_a_cache_miss_does_not_leave_a_stale_window() {
    let e = Arc::new(engine_with(Arc::new(SlowScanBackend {
        inner: MemoryBackend::new(),
        pause: Duration::from_millis(100),
    })));
    let h = base_hour();
    e.aggregator
        .ingest(&batch(
            "b1",
            vec![
                leg("t1", "u", "w", 10.0, 1.0, h + 1),
                leg("t2", "u", "w", 0.0, 0.0, h + 2 * HOUR_MS),
            ],
        ))
        .await
        .expect("ingest");

    let (from, to) = (h, h + 2 * HOUR_MS);
    let reader = {
        let e = e.clone();
        tokio::spawn(async move {
            e.aggregator
                .asset_volume("A", &client("u"), from, to)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    e.aggregator
        .ingest(&batch("b2", vec![leg("t3", "u", "w", 3.0, 1.0, h + 10)]))
        .await
        .expect("ingest");
    reader.await.expect("join").expect("query");

    let served = e
        .aggregator
        .asset_volume("A", &client("u"), from, to)
        .await
        .expect("query");
    let live = e
        .aggregator
        .store()
        .sum_range("A", None, &client("u"), from, to, None)
        .await
        .expect("sum");
    assert_approx_eq!(live, 13.0, 1e-12);
    assert_approx_eq!(served, live, 1e-9);
}

#[tokio::test]
async fn repeating_a_cumulative_write_leaves_sums_unchanged() {
    let e = engine();
    let h = base_hour();
    let store = e.aggregator.store();
    for _ in 0..3 {
        store
            .write_both_legs(h, "u", SubjectKind::User, "A", 12.5, "B", 4.0)
            .await
            .expect("write");
    }
    let v = store
        .sum_range("A", None, &client("u"), h, h + HOUR_MS, None)
        .await
        .expect("sum");
    assert_approx_eq!(v, 12.5, 1e-12);
    let q = store
        .sum_range("B", Some("A"), &client("u"), h, h + HOUR_MS, None)
        .await
        .expect("sum");
    assert_approx_eq!(q, 4.0, 1e-12);
}
