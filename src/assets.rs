use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{AssetPairDef, AssetsConfig};
use crate::error::{VolumeError, VolumeResult};

/// Asset and asset-pair name resolution.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    /// `(base_asset_id, quoting_asset_id)` of a pair.
    async fn resolve_pair(&self, pair_id: &str) -> VolumeResult<(String, String)>;

    /// Shortened display alias of an asset, used for over-long table names.
    async fn short_alias(&self, asset_id: &str) -> VolumeResult<String>;

    async fn has_asset(&self, asset_id: &str) -> VolumeResult<bool>;
}

/// In-memory registry built from config and, optionally, a one-shot registry fetch.
#[derive(Debug, Default, Clone)]
pub struct StaticAssetResolver {
    pairs: HashMap<String, (String, String)>,
    aliases: HashMap<String, String>,
    assets: HashSet<String>,
}

impl StaticAssetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &AssetsConfig) -> Self {
        let mut out = Self::new();
        for p in &cfg.pairs {
            out.add_pair(p);
        }
        for (asset, alias) in &cfg.aliases {
            out.add_alias(asset, alias);
        }
        out
    }

    pub fn add_pair(&mut self, pair: &AssetPairDef) {
        self.assets.insert(pair.base.clone());
        self.assets.insert(pair.quote.clone());
        self.pairs
            .insert(pair.id.clone(), (pair.base.clone(), pair.quote.clone()));
    }

    pub fn add_alias(&mut self, asset_id: &str, alias: &str) {
        self.assets.insert(asset_id.to_string());
        self.aliases.insert(asset_id.to_string(), alias.to_string());
    }

    pub fn add_asset(&mut self, asset_id: &str) {
        self.assets.insert(asset_id.to_string());
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn merge(&mut self, snapshot: RegistrySnapshot) {
        for p in &snapshot.pairs {
            self.add_pair(p);
        }
        for asset in &snapshot.assets {
            self.add_asset(asset);
        }
        for (asset, alias) in &snapshot.aliases {
            self.add_alias(asset, alias);
        }
    }
}

#[async_trait]
impl AssetResolver for StaticAssetResolver {
    async fn resolve_pair(&self, pair_id: &str) -> VolumeResult<(String, String)> {
        self.pairs
            .get(pair_id)
            .cloned()
            .ok_or_else(|| VolumeError::UnknownAssetPair(pair_id.to_string()))
    }

    async fn short_alias(&self, asset_id: &str) -> VolumeResult<String> {
        self.aliases
            .get(asset_id)
            .cloned()
            .ok_or_else(|| VolumeError::UnknownAsset(asset_id.to_string()))
    }

    async fn has_asset(&self, asset_id: &str) -> VolumeResult<bool> {
        Ok(self.assets.contains(asset_id))
    }
}

#[derive(Debug, Deserialize)]
struct RegistryPair {
    id: String,
    #[serde(rename = "baseAssetId")]
    base_asset_id: String,
    #[serde(rename = "quotingAssetId")]
    quoting_asset_id: String,
}

#[derive(Debug, Deserialize)]
struct RegistryAsset {
    id: String,
    #[serde(rename = "displayId", default)]
    display_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub pairs: Vec<AssetPairDef>,
    /// Every registered asset id, aliased or not.
    pub assets: Vec<String>,
    pub aliases: Vec<(String, String)>,
}

/// Fetches asset pairs and display aliases from `registry_url` when configured.
pub async fn fetch_registry(cfg: &AssetsConfig) -> anyhow::Result<Option<RegistrySnapshot>> {
    let Some(base) = cfg.registry_url.as_deref() else {
        return Ok(None);
    };
    let base = base.trim_end_matches('/');

    let client = reqwest::Client::builder()
        .user_agent(concat!("tradevol/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_millis(cfg.registry_timeout_ms))
        .build()
        .context("build http client")?;

    let pairs: Vec<RegistryPair> = client
        .get(format!("{base}/asset-pairs"))
        .send()
        .await
        .context("GET asset-pairs")?
        .error_for_status()
        .context("asset-pairs status")?
        .json()
        .await
        .context("decode asset-pairs")?;

    let assets: Vec<RegistryAsset> = client
        .get(format!("{base}/assets"))
        .send()
        .await
        .context("GET assets")?
        .error_for_status()
        .context("assets status")?
        .json()
        .await
        .context("decode assets")?;

    let snapshot = registry_snapshot(pairs, assets);
    info!(
        pairs = snapshot.pairs.len(),
        assets = snapshot.assets.len(),
        aliases = snapshot.aliases.len(),
        "loaded asset registry"
    );
    Ok(Some(snapshot))
}

fn registry_snapshot(pairs: Vec<RegistryPair>, assets: Vec<RegistryAsset>) -> RegistrySnapshot {
    let mut snapshot = RegistrySnapshot::default();
    for p in pairs {
        if p.base_asset_id == p.quoting_asset_id {
            warn!(pair_id = %p.id, "skip registry pair: base == quote");
            continue;
        }
        snapshot.pairs.push(AssetPairDef {
            id: p.id,
            base: p.base_asset_id,
            quote: p.quoting_asset_id,
        });
    }
    for a in assets {
        if let Some(alias) = a.display_id.filter(|s| !s.trim().is_empty()) {
            snapshot.aliases.push((a.id.clone(), alias));
        }
        snapshot.assets.push(a.id);
    }
    snapshot
}
