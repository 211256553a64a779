use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::assets::AssetResolver;
use crate::buckets::{hour_floor, hours_in_range, utc_date, HOUR_MS};
use crate::error::{VolumeError, VolumeResult};
use crate::hashing::storage_subject_key;
use crate::types::{ClientSelector, LegVolume, SubjectKind, WILDCARD_CLIENT};

const TABLE_PREFIX: &str = "v";
const DATE_SUFFIX_LEN: usize = 9; // "_YYYYMMDD"

/// Row key inside one `(asset, date)` table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub hour_ms: u64,
    /// Storage form of the subject kind and id (see `hashing::storage_subject_key`).
    pub subject: String,
    pub counter_asset: String,
}

/// Cumulative volume of the table's asset traded against `key.counter_asset` by one subject
/// within one hour.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeRow {
    pub key: RowKey,
    pub kind: SubjectKind,
    pub volume: f64,
    pub counter_volume: f64,
}

/// Filter on the subject key component of a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubjectFilter {
    Eq(String),
    Ne(String),
}

impl SubjectFilter {
    fn matches(&self, subject: &str) -> bool {
        match self {
            SubjectFilter::Eq(s) => s == subject,
            SubjectFilter::Ne(s) => s != subject,
        }
    }
}

/// Logical contract of the table storage engine.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn table_exists(&self, table: &str) -> VolumeResult<bool>;

    /// Creates the table on first write. Overwrites any row with the same key.
    async fn upsert(&self, table: &str, row: VolumeRow) -> VolumeResult<()>;

    async fn get(&self, table: &str, key: &RowKey) -> VolumeResult<Option<VolumeRow>>;

    /// Rows of one hour bucket whose subject passes `subject`.
    async fn scan_hour(
        &self,
        table: &str,
        hour_ms: u64,
        subject: &SubjectFilter,
    ) -> VolumeResult<Vec<VolumeRow>>;
}

/// Process-local backend. Durable engines implement `StoreBackend` against their own client.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, BTreeMap<RowKey, VolumeRow>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_count(&self) -> usize {
        self.tables.read().len()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn table_exists(&self, table: &str) -> VolumeResult<bool> {
        Ok(self.tables.read().contains_key(table))
    }

    async fn upsert(&self, table: &str, row: VolumeRow) -> VolumeResult<()> {
        let mut tables = self.tables.write();
        tables
            .entry(table.to_string())
            .or_default()
            .insert(row.key.clone(), row);
        Ok(())
    }

    async fn get(&self, table: &str, key: &RowKey) -> VolumeResult<Option<VolumeRow>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn scan_hour(
        &self,
        table: &str,
        hour_ms: u64,
        subject: &SubjectFilter,
    ) -> VolumeResult<Vec<VolumeRow>> {
        let tables = self.tables.read();
        let Some(t) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let lo = RowKey {
            hour_ms,
            subject: String::new(),
            counter_asset: String::new(),
        };
        let hi = RowKey {
            hour_ms: hour_ms + 1,
            subject: String::new(),
            counter_asset: String::new(),
        };
        Ok(t.range(lo..hi)
            .filter(|(k, _)| subject.matches(&k.subject))
            .map(|(_, row)| row.clone())
            .collect())
    }
}

/// Authoritative per-hour cumulative volumes, one logical table per `(asset, UTC date)`.
///
/// Writes are last-write-wins overwrites: callers pass already-combined cumulative totals,
/// which is what makes batch redelivery safe at the storage layer.
pub struct VolumeStore {
    backend: Arc<dyn StoreBackend>,
    resolver: Arc<dyn AssetResolver>,
    max_table_name_len: usize,
    table_prefixes: DashMap<String, String>,
}

impl VolumeStore {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        resolver: Arc<dyn AssetResolver>,
        max_table_name_len: usize,
    ) -> Self {
        Self {
            backend,
            resolver,
            max_table_name_len,
            table_prefixes: DashMap::new(),
        }
    }

    /// Table holding `asset_id` rows for the UTC date of `ts_ms`.
    pub async fn table_name(&self, asset_id: &str, ts_ms: u64) -> VolumeResult<String> {
        let prefix = self.table_prefix(asset_id).await?;
        let date = utc_date(ts_ms).format("%Y%m%d");
        Ok(format!("{prefix}_{date}"))
    }

    async fn table_prefix(&self, asset_id: &str) -> VolumeResult<String> {
        if let Some(p) = self.table_prefixes.get(asset_id) {
            return Ok(p.clone());
        }

        let budget = self.max_table_name_len.saturating_sub(DATE_SUFFIX_LEN);
        let natural = format!("{TABLE_PREFIX}{}", strip_separators(asset_id));
        let prefix = if natural.len() > TABLE_PREFIX.len() && natural.len() <= budget {
            natural
        } else {
            let alias = self.resolver.short_alias(asset_id).await?;
            let short = format!("{TABLE_PREFIX}{}", strip_separators(&alias));
            if short.len() <= TABLE_PREFIX.len() || short.len() > budget {
                return Err(VolumeError::storage(format!(
                    "no usable table name for asset {asset_id} (alias {alias:?})"
                )));
            }
            debug!(asset_id, alias = %alias, "using short alias for table name");
            short
        };

        self.table_prefixes
            .insert(asset_id.to_string(), prefix.clone());
        Ok(prefix)
    }

    /// Current cumulative snapshot of `subject_id` for `asset_id` vs `counter_asset_id` in the
    /// bucket of `bucket_time_ms`; zero when never written.
    pub async fn read_leg(
        &self,
        bucket_time_ms: u64,
        subject_id: &str,
        kind: SubjectKind,
        asset_id: &str,
        counter_asset_id: &str,
    ) -> VolumeResult<LegVolume> {
        let table = self.table_name(asset_id, bucket_time_ms).await?;
        let key = RowKey {
            hour_ms: hour_floor(bucket_time_ms),
            subject: storage_subject_key(kind, subject_id),
            counter_asset: counter_asset_id.to_string(),
        };
        let row = self.backend.get(&table, &key).await?;
        Ok(row
            .map(|r| LegVolume {
                volume: r.volume,
                counter_volume: r.counter_volume,
            })
            .unwrap_or(LegVolume::ZERO))
    }

    /// Upserts the base leg and its mirror in the quoting asset's table.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_both_legs(
        &self,
        bucket_time_ms: u64,
        subject_id: &str,
        kind: SubjectKind,
        base_asset_id: &str,
        base_volume_cumulative: f64,
        quoting_asset_id: &str,
        quoting_volume_cumulative: f64,
    ) -> VolumeResult<()> {
        let hour_ms = hour_floor(bucket_time_ms);
        let subject = storage_subject_key(kind, subject_id);

        let base_table = self.table_name(base_asset_id, hour_ms).await?;
        let quote_table = self.table_name(quoting_asset_id, hour_ms).await?;

        self.backend
            .upsert(
                &base_table,
                VolumeRow {
                    key: RowKey {
                        hour_ms,
                        subject: subject.clone(),
                        counter_asset: quoting_asset_id.to_string(),
                    },
                    kind,
                    volume: base_volume_cumulative,
                    counter_volume: quoting_volume_cumulative,
                },
            )
            .await?;
        self.backend
            .upsert(
                &quote_table,
                VolumeRow {
                    key: RowKey {
                        hour_ms,
                        subject,
                        counter_asset: base_asset_id.to_string(),
                    },
                    kind,
                    volume: quoting_volume_cumulative,
                    counter_volume: base_volume_cumulative,
                },
            )
            .await?;
        Ok(())
    }

    /// Sum of `subject_asset_id` volume over every whole hour in `[from_ms, to_ms)`.
    ///
    /// The wildcard client counts every user row except its own pre-aggregated row, and the
    /// raw sum is halved since both parties of a trade hold a row for the same volume.
    /// `exclude_client_id` names a user.
    pub async fn sum_range(
        &self,
        subject_asset_id: &str,
        counter_asset_id: Option<&str>,
        client: &ClientSelector,
        from_ms: u64,
        to_ms: u64,
        exclude_client_id: Option<&str>,
    ) -> VolumeResult<f64> {
        if to_ms <= from_ms {
            return Ok(0.0);
        }

        let filter = match client.subject() {
            None => SubjectFilter::Ne(WILDCARD_CLIENT.to_string()),
            Some((kind, id)) => SubjectFilter::Eq(storage_subject_key(kind, id)),
        };
        let exclude = exclude_client_id.map(|id| storage_subject_key(SubjectKind::User, id));

        let mut sum = 0.0f64;
        for hour_ms in hours_in_range(from_ms, to_ms) {
            let table = self.table_name(subject_asset_id, hour_ms).await?;
            if !self.backend.table_exists(&table).await? {
                continue;
            }
            let rows = self.backend.scan_hour(&table, hour_ms, &filter).await?;
            sum += rows
                .iter()
                .filter(|r| !client.is_all() || r.kind == SubjectKind::User)
                .filter(|r| counter_asset_id.map_or(true, |c| r.key.counter_asset == c))
                .filter(|r| exclude.as_deref() != Some(r.key.subject.as_str()))
                .filter(|r| r.volume.is_finite())
                .map(|r| r.volume)
                .sum::<f64>();
        }

        if client.is_all() {
            sum /= 2.0;
        }
        Ok(sum)
    }

    /// Both leg sums of one pair for the single hour bucket of `bucket_time_ms`.
    pub async fn pair_values(
        &self,
        bucket_time_ms: u64,
        client: &ClientSelector,
        base_asset_id: &str,
        quoting_asset_id: &str,
        exclude_client_id: Option<&str>,
    ) -> VolumeResult<(f64, f64)> {
        let from_ms = hour_floor(bucket_time_ms);
        let to_ms = from_ms + HOUR_MS;
        let base = self
            .sum_range(
                base_asset_id,
                Some(quoting_asset_id),
                client,
                from_ms,
                to_ms,
                exclude_client_id,
            )
            .await?;
        let quote = self
            .sum_range(
                quoting_asset_id,
                Some(base_asset_id),
                client,
                from_ms,
                to_ms,
                exclude_client_id,
            )
            .await?;
        Ok((base, quote))
    }
}

fn strip_separators(asset_id: &str) -> String {
    asset_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
