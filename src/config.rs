use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_toml_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = toml::from_str(raw).context("decode toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.retention_hours == 0 {
            anyhow::bail!("invalid cache.retention_hours=0 (must be > 0)");
        }
        if self.cache.eviction_interval_secs == 0 {
            anyhow::bail!("invalid cache.eviction_interval_secs=0 (must be > 0)");
        }
        if self.ingest.channel_capacity == 0 {
            anyhow::bail!("invalid ingest.channel_capacity=0 (must be > 0)");
        }
        if self.health.heartbeat_interval_secs == 0 {
            anyhow::bail!("invalid health.heartbeat_interval_secs=0 (must be > 0)");
        }
        // Table names carry an 8-char date suffix plus a 1-char prefix.
        if self.store.max_table_name_len < 16 {
            anyhow::bail!(
                "invalid store.max_table_name_len={} (must be >= 16)",
                self.store.max_table_name_len
            );
        }
        if self.channel.retry_delay_ms == 0 && self.channel.retry_window_ms > 0 {
            anyhow::bail!("invalid channel.retry_delay_ms=0 with a non-zero retry window");
        }

        for p in &self.assets.pairs {
            if p.id.trim().is_empty() || p.base.trim().is_empty() || p.quote.trim().is_empty() {
                anyhow::bail!("invalid assets.pairs entry {:?}: empty field", p.id);
            }
            if p.base == p.quote {
                anyhow::bail!("invalid assets.pairs entry {}: base == quote", p.id);
            }
        }

        Ok(())
    }

    pub fn health_path(&self) -> PathBuf {
        self.run.data_dir.join(crate::schema::FILE_HEALTH_JSONL)
    }

    pub fn dead_letter_path(&self) -> PathBuf {
        self.run.data_dir.join(crate::schema::FILE_DEAD_LETTER_JSONL)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngestConfig {
    /// Watermark jump (ms) at or above which a staleness warning is emitted.
    #[serde(default = "default_warning_delay_ms")]
    pub warning_delay_ms: u64,
    /// Minimum spacing between two staleness warnings.
    #[serde(default = "default_staleness_warning_interval_ms")]
    pub staleness_warning_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            warning_delay_ms: default_warning_delay_ms(),
            staleness_warning_interval_ms: default_staleness_warning_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_warning_delay_ms() -> u64 {
    300_000
}

fn default_staleness_warning_interval_ms() -> u64 {
    60_000
}

fn default_channel_capacity() -> usize {
    1_024
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Soft limit on distinct client keys; exceeding it only logs.
    #[serde(default = "default_client_warn_threshold")]
    pub client_warn_threshold: usize,
}

impl CacheConfig {
    pub fn retention_ms(&self) -> u64 {
        self.retention_hours.saturating_mul(crate::buckets::HOUR_MS)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            eviction_interval_secs: default_eviction_interval_secs(),
            client_warn_threshold: default_client_warn_threshold(),
        }
    }
}

fn default_retention_hours() -> u64 {
    72
}

fn default_eviction_interval_secs() -> u64 {
    15 * 60
}

fn default_client_warn_threshold() -> usize {
    1_000
}

#[derive(Clone, Debug, Deserialize)]
pub struct StoreConfig {
    /// Identifier length limit of the storage engine.
    #[serde(default = "default_max_table_name_len")]
    pub max_table_name_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_table_name_len: default_max_table_name_len(),
        }
    }
}

fn default_max_table_name_len() -> usize {
    48
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    /// Fixed delay between redelivery attempts of a failed batch.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Total time a batch may keep failing before it is dead-lettered.
    /// `0` dead-letters on the first failure.
    #[serde(default = "default_retry_window_ms")]
    pub retry_window_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            retry_window_ms: default_retry_window_ms(),
        }
    }
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_retry_window_ms() -> u64 {
    30_000
}

#[derive(Clone, Debug, Deserialize)]
pub struct AssetsConfig {
    #[serde(default)]
    pub pairs: Vec<AssetPairDef>,
    /// Short display aliases used when an asset id is too long for a table name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Optional asset registry base URL; entries it returns are merged over the static ones.
    #[serde(default)]
    pub registry_url: Option<String>,
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            aliases: BTreeMap::new(),
            registry_url: None,
            registry_timeout_ms: default_registry_timeout_ms(),
        }
    }
}

fn default_registry_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct AssetPairDef {
    pub id: String,
    pub base: String,
    pub quote: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = Config::from_toml_str("").expect("defaults");
        assert_eq!(cfg.cache.retention_hours, 72);
        assert_eq!(cfg.cache.eviction_interval_secs, 900);
        assert_eq!(cfg.cache.client_warn_threshold, 1_000);
        assert_eq!(cfg.ingest.staleness_warning_interval_ms, 60_000);
        assert_eq!(cfg.store.max_table_name_len, 48);
        assert!(cfg.assets.pairs.is_empty());
    }

    #[test]
    fn pairs_and_aliases_parse() {
        let raw = r#"
            [cache]
            retention_hours = 24

            [assets]
            aliases = { "LONG-ASSET-ID" = "LAI" }

            [[assets.pairs]]
            id = "BTCUSD"
            base = "BTC"
            quote = "USD"
        "#;
        let cfg = Config::from_toml_str(raw).expect("parse");
        assert_eq!(cfg.cache.retention_ms(), 24 * crate::buckets::HOUR_MS);
        assert_eq!(cfg.assets.pairs.len(), 1);
        assert_eq!(cfg.assets.pairs[0].quote, "USD");
        assert_eq!(cfg.assets.aliases.get("LONG-ASSET-ID").map(String::as_str), Some("LAI"));
    }

    #[test]
    fn zero_retention_is_rejected() {
        let err = Config::from_toml_str("[cache]\nretention_hours = 0\n").unwrap_err();
        assert!(err.to_string().contains("retention_hours"));
    }

    #[test]
    fn self_pair_is_rejected() {
        let raw = r#"
            [[assets.pairs]]
            id = "XX"
            base = "X"
            quote = "X"
        "#;
        assert!(Config::from_toml_str(raw).is_err());
    }
}
