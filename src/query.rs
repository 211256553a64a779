use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::aggregator::Aggregator;
use crate::buckets::{day_start_ms, DAY_MS};
use crate::error::{VolumeError, VolumeResult};
use crate::types::{ClientSelector, PairVolume};

/// Day-granularity query surface. `to_date` is inclusive: a query covers
/// `[from_date 00:00, to_date + 1 day 00:00)` UTC, then the watermark clamp applies.
#[derive(Clone)]
pub struct VolumeQueries {
    aggregator: Arc<Aggregator>,
}

impl VolumeQueries {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }

    pub async fn asset_volume(
        &self,
        asset_id: &str,
        client: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> VolumeResult<f64> {
        let (from_ms, to_ms) = day_range(from_date, to_date)?;
        if !self.aggregator.resolver().has_asset(asset_id).await? {
            return Err(VolumeError::UnknownAsset(asset_id.to_string()));
        }
        let client = ClientSelector::parse(client);
        debug!(asset_id, %client, from_ms, to_ms, "asset volume query");
        self.aggregator
            .asset_volume(asset_id, &client, from_ms, to_ms)
            .await
    }

    pub async fn asset_pair_volume(
        &self,
        pair_id: &str,
        client: &str,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> VolumeResult<PairVolume> {
        let (from_ms, to_ms) = day_range(from_date, to_date)?;
        let client = ClientSelector::parse(client);
        debug!(pair_id, %client, from_ms, to_ms, "asset pair volume query");
        self.aggregator
            .asset_pair_volume(pair_id, &client, from_ms, to_ms)
            .await
    }
}

fn day_range(from_date: NaiveDate, to_date: NaiveDate) -> VolumeResult<(u64, u64)> {
    if from_date > to_date {
        return Err(VolumeError::InvalidRange {
            from: from_date.to_string(),
            to: to_date.to_string(),
        });
    }
    Ok((day_start_ms(from_date), day_start_ms(to_date) + DAY_MS))
}
