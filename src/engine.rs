use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::assets::{fetch_registry, AssetResolver, StaticAssetResolver};
use crate::cache::{AssetVolumeCache, Evictable, PairVolumeCache};
use crate::config::Config;
use crate::eviction::EvictionService;
use crate::health::HealthCounters;
use crate::query::VolumeQueries;
use crate::volume_store::{MemoryBackend, StoreBackend, VolumeStore};
use crate::watermark::Watermark;

/// Wired-up ingest and query path sharing one store, cache pair and watermark.
pub struct Engine {
    pub aggregator: Arc<Aggregator>,
    pub asset_cache: Arc<AssetVolumeCache>,
    pub pair_cache: Arc<PairVolumeCache>,
    pub health: Arc<HealthCounters>,
    pub queries: VolumeQueries,
}

impl Engine {
    pub fn new(
        cfg: &Config,
        backend: Arc<dyn StoreBackend>,
        resolver: Arc<dyn AssetResolver>,
    ) -> Self {
        let health = Arc::new(HealthCounters::default());
        let store = Arc::new(VolumeStore::new(
            backend,
            resolver.clone(),
            cfg.store.max_table_name_len,
        ));
        let retention_ms = cfg.cache.retention_ms();
        let asset_cache = Arc::new(AssetVolumeCache::new(
            "asset",
            retention_ms,
            cfg.cache.client_warn_threshold,
        ));
        let pair_cache = Arc::new(PairVolumeCache::new(
            "asset_pair",
            retention_ms,
            cfg.cache.client_warn_threshold,
        ));
        let watermark = Watermark::new(
            cfg.ingest.warning_delay_ms,
            cfg.ingest.staleness_warning_interval_ms,
        );
        let aggregator = Arc::new(Aggregator::new(
            store,
            asset_cache.clone(),
            pair_cache.clone(),
            resolver,
            watermark,
            health.clone(),
        ));
        let queries = VolumeQueries::new(aggregator.clone());

        Self {
            aggregator,
            asset_cache,
            pair_cache,
            health,
            queries,
        }
    }

    /// In-memory store with the configured static assets plus the optional registry.
    pub async fn in_memory(cfg: &Config) -> anyhow::Result<Self> {
        let resolver = load_resolver(cfg).await?;
        Ok(Self::new(cfg, Arc::new(MemoryBackend::new()), Arc::new(resolver)))
    }

    pub fn eviction_service(&self, cfg: &Config) -> EvictionService {
        let caches: Vec<Arc<dyn Evictable>> =
            vec![self.asset_cache.clone(), self.pair_cache.clone()];
        EvictionService::new(
            caches,
            Duration::from_secs(cfg.cache.eviction_interval_secs),
            self.health.clone(),
        )
    }
}

/// Static assets from config, with registry entries merged over them. A registry failure only
/// warns; the static set is still usable.
pub async fn load_resolver(cfg: &Config) -> anyhow::Result<StaticAssetResolver> {
    let mut resolver = StaticAssetResolver::from_config(&cfg.assets);
    match fetch_registry(&cfg.assets).await {
        Ok(Some(snapshot)) => resolver.merge(snapshot),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "asset registry fetch failed; using static assets only"),
    }
    info!(pairs = resolver.pair_count(), "asset resolver ready");
    Ok(resolver)
}
