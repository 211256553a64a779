use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::{debug, info, warn};

use crate::assets::AssetResolver;
use crate::buckets::{hour_index, spans_day_boundary};
use crate::cache::{AssetVolumeCache, PairVolumeCache};
use crate::error::VolumeResult;
use crate::health::HealthCounters;
use crate::types::{
    now_ms, pair_subject_key, round_volume, subject_cache_key, ClientSelector, LegVolume,
    PairVolume, SubjectKind, TradeBatch, TradeEvent, WILDCARD_CLIENT,
};
use crate::volume_store::VolumeStore;
use crate::watermark::Watermark;

/// Outcome of one committed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestSummary {
    pub batch_id: String,
    pub events: usize,
    pub groups: usize,
    pub user_writes: usize,
    pub wallet_writes: usize,
    pub duplicate_user_legs: usize,
    pub windows_reconciled: usize,
    pub watermark_ms: Option<u64>,
    pub stale_warning: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    hour: u64,
    asset_id: String,
    opposite_asset_id: String,
}

struct Group<'a> {
    /// Max event timestamp of the group; selects the storage bucket.
    time_ms: u64,
    events: Vec<&'a TradeEvent>,
}

/// Per-subject result of folding one group.
struct SubjectDelta {
    subject: String,
    kind: SubjectKind,
    cumulative: LegVolume,
    delta: LegVolume,
}

/// Folds trade batches into cumulative hour buckets and serves watermark-bounded range queries
/// through the read-through caches.
pub struct Aggregator {
    store: Arc<VolumeStore>,
    asset_cache: Arc<AssetVolumeCache>,
    pair_cache: Arc<PairVolumeCache>,
    resolver: Arc<dyn AssetResolver>,
    watermark: Watermark,
    health: Arc<HealthCounters>,
}

impl Aggregator {
    pub fn new(
        store: Arc<VolumeStore>,
        asset_cache: Arc<AssetVolumeCache>,
        pair_cache: Arc<PairVolumeCache>,
        resolver: Arc<dyn AssetResolver>,
        watermark: Watermark,
        health: Arc<HealthCounters>,
    ) -> Self {
        Self {
            store,
            asset_cache,
            pair_cache,
            resolver,
            watermark,
            health,
        }
    }

    pub fn watermark(&self) -> Option<u64> {
        self.watermark.get()
    }

    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<dyn AssetResolver> {
        &self.resolver
    }

    /// Applies one batch. Any store error aborts the batch and is returned unchanged; the
    /// watermark only moves once every group has been written and reconciled.
    pub async fn ingest(&self, batch: &TradeBatch) -> VolumeResult<IngestSummary> {
        let mut summary = IngestSummary {
            batch_id: batch.batch_id.clone(),
            events: batch.events.len(),
            ..IngestSummary::default()
        };
        let Some(batch_max_ts) = batch.max_ts_ms() else {
            debug!(batch_id = %batch.batch_id, "empty batch");
            summary.watermark_ms = self.watermark.get();
            return Ok(summary);
        };

        let min_ts = batch
            .events
            .iter()
            .map(|e| e.ts_ms)
            .min()
            .unwrap_or(batch_max_ts);
        if spans_day_boundary(min_ts, batch_max_ts) {
            debug!(
                batch_id = %batch.batch_id,
                min_ts,
                max_ts = batch_max_ts,
                "batch spans a UTC day boundary"
            );
        }

        // Last write wins.
        let mut wallet_users: HashMap<&str, &str> = HashMap::new();
        for ev in &batch.events {
            wallet_users.insert(ev.wallet_id.as_str(), ev.user_id.as_str());
        }

        let groups = group_events(&batch.events);
        summary.groups = groups.len();

        {
            let _asset_write = self.asset_cache.begin_write();
            let _pair_write = self.pair_cache.begin_write();
            for (key, group) in &groups {
                let deltas = self.fold_group(key, group, &wallet_users, &mut summary).await?;
                summary.windows_reconciled += self.reconcile_caches(key, group.time_ms, &deltas);
            }
        }

        let adv = self.watermark.advance(batch_max_ts, now_ms());
        if adv.stale_warning {
            self.health.inc_stale_warnings(1);
            warn!(
                batch_id = %batch.batch_id,
                previous_ms = adv.previous.unwrap_or_default(),
                batch_max_ms = batch_max_ts,
                lag_ms = batch_max_ts.saturating_sub(adv.previous.unwrap_or_default()),
                "ingest is falling behind"
            );
        }
        summary.watermark_ms = Some(adv.current);
        summary.stale_warning = adv.stale_warning;

        self.health.inc_batches_ingested(1);
        self.health.inc_events_ingested(summary.events as u64);
        self.health
            .inc_duplicate_user_legs(summary.duplicate_user_legs as u64);
        self.health
            .inc_snapshots_written((summary.user_writes + summary.wallet_writes) as u64);
        self.health.set_last_ingest_ms(now_ms());
        self.health.set_watermark_ms(adv.current);

        info!(
            batch_id = %summary.batch_id,
            events = summary.events,
            groups = summary.groups,
            duplicates = summary.duplicate_user_legs,
            watermark_ms = adv.current,
            "batch ingested"
        );
        Ok(summary)
    }

    async fn fold_group(
        &self,
        key: &GroupKey,
        group: &Group<'_>,
        wallet_users: &HashMap<&str, &str>,
        summary: &mut IngestSummary,
    ) -> VolumeResult<Vec<SubjectDelta>> {
        let user_of = |ev: &TradeEvent| -> String {
            wallet_users
                .get(ev.wallet_id.as_str())
                .copied()
                .unwrap_or(ev.user_id.as_str())
                .to_string()
        };

        let mut users: BTreeSet<String> = BTreeSet::new();
        let mut wallets: BTreeSet<String> = BTreeSet::new();
        for ev in group.events.iter().copied() {
            users.insert(user_of(ev));
            wallets.insert(ev.wallet_id.clone());
        }

        let subjects: Vec<(String, SubjectKind)> = users
            .into_iter()
            .map(|u| (u, SubjectKind::User))
            .chain(wallets.into_iter().map(|w| (w, SubjectKind::Wallet)))
            .collect();

        let snapshots = try_join_all(subjects.iter().map(|(subject, kind)| {
            self.store.read_leg(
                group.time_ms,
                subject,
                *kind,
                &key.asset_id,
                &key.opposite_asset_id,
            )
        }))
        .await?;

        let mut user_delta: HashMap<String, LegVolume> = HashMap::new();
        let mut wallet_delta: HashMap<String, LegVolume> = HashMap::new();
        let mut seen: HashSet<(String, &str)> = HashSet::new();
        for ev in group.events.iter().copied() {
            let leg = ev.leg();
            let user = user_of(ev);
            if seen.insert((user.clone(), ev.trade_id.as_str())) {
                *user_delta.entry(user).or_default() += leg;
            } else {
                summary.duplicate_user_legs += 1;
            }
            *wallet_delta.entry(ev.wallet_id.clone()).or_default() += leg;
        }

        let mut out = Vec::with_capacity(subjects.len());
        for ((subject, kind), snapshot) in subjects.into_iter().zip(snapshots) {
            let delta = match kind {
                SubjectKind::User => user_delta.get(&subject),
                SubjectKind::Wallet => wallet_delta.get(&subject),
            }
            .copied()
            .unwrap_or(LegVolume::ZERO);
            let cumulative = snapshot + delta;

            self.store
                .write_both_legs(
                    group.time_ms,
                    &subject,
                    kind,
                    &key.asset_id,
                    cumulative.volume,
                    &key.opposite_asset_id,
                    cumulative.counter_volume,
                )
                .await?;
            match kind {
                SubjectKind::User => summary.user_writes += 1,
                SubjectKind::Wallet => summary.wallet_writes += 1,
            }
            out.push(SubjectDelta {
                subject,
                kind,
                cumulative,
                delta,
            });
        }

        debug!(
            asset = %key.asset_id,
            opposite = %key.opposite_asset_id,
            bucket_ms = group.time_ms,
            subjects = out.len(),
            "group written"
        );
        Ok(out)
    }

    /// Pushes the group's deltas into every cached window covering its bucket.
    fn reconcile_caches(&self, key: &GroupKey, time_ms: u64, deltas: &[SubjectDelta]) -> usize {
        let forward = pair_subject_key(&key.asset_id, &key.opposite_asset_id);
        let backward = pair_subject_key(&key.opposite_asset_id, &key.asset_id);

        let mut touched = 0usize;
        let mut apply = |client: &str, delta: LegVolume| {
            touched += self
                .asset_cache
                .reconcile(client, &key.asset_id, time_ms, delta.volume);
            touched += self.asset_cache.reconcile(
                client,
                &key.opposite_asset_id,
                time_ms,
                delta.counter_volume,
            );
            touched += self
                .pair_cache
                .reconcile(client, &forward, time_ms, PairVolume::from(delta));
            touched += self.pair_cache.reconcile(
                client,
                &backward,
                time_ms,
                PairVolume::from(delta.mirrored()),
            );
        };

        let mut users_total = LegVolume::ZERO;
        for d in deltas {
            apply(&*subject_cache_key(d.kind, &d.subject), d.delta);
            if d.kind == SubjectKind::User {
                users_total += d.delta;
            }
            debug!(
                subject = %d.subject,
                kind = d.kind.as_str(),
                cumulative = d.cumulative.volume,
                "subject bucket updated"
            );
        }
        apply(
            WILDCARD_CLIENT,
            LegVolume {
                volume: users_total.volume / 2.0,
                counter_volume: users_total.counter_volume / 2.0,
            },
        );
        touched
    }

    /// Volume of `asset_id` for `client` over `[from_ms, to_ms)`, with `to_ms` clamped to the
    /// watermark's hour. Zero before the first batch or when the clamped range is empty.
    pub async fn asset_volume(
        &self,
        asset_id: &str,
        client: &ClientSelector,
        from_ms: u64,
        to_ms: u64,
    ) -> VolumeResult<f64> {
        let Some(to_ms) = self.clamp(from_ms, to_ms) else {
            return Ok(0.0);
        };

        let client_key = client.cache_key();
        if let Some(v) = self
            .asset_cache
            .lookup(&client_key, asset_id, from_ms, to_ms)
        {
            self.health.inc_cache_hits(1);
            return Ok(v);
        }
        self.health.inc_cache_misses(1);

        let stamp = self.asset_cache.write_stamp();
        let raw = self
            .store
            .sum_range(asset_id, None, client, from_ms, to_ms, None)
            .await?;
        if let Some(stamp) = stamp {
            self.asset_cache
                .store_unless_written(stamp, &client_key, asset_id, from_ms, to_ms, raw);
        }
        Ok(round_volume(raw))
    }

    /// Both leg volumes of a pair, each restricted to the other asset as counterpart.
    pub async fn asset_pair_volume(
        &self,
        pair_id: &str,
        client: &ClientSelector,
        from_ms: u64,
        to_ms: u64,
    ) -> VolumeResult<PairVolume> {
        let (base, quote) = self.resolver.resolve_pair(pair_id).await?;
        let Some(to_ms) = self.clamp(from_ms, to_ms) else {
            return Ok(PairVolume::default());
        };

        let subject = pair_subject_key(&base, &quote);
        let client_key = client.cache_key();
        if let Some(v) = self
            .pair_cache
            .lookup(&client_key, &subject, from_ms, to_ms)
        {
            self.health.inc_cache_hits(1);
            return Ok(v);
        }
        self.health.inc_cache_misses(1);

        let stamp = self.pair_cache.write_stamp();
        let base_sum = self
            .store
            .sum_range(&base, Some(&quote), client, from_ms, to_ms, None)
            .await?;
        let quote_sum = self
            .store
            .sum_range(&quote, Some(&base), client, from_ms, to_ms, None)
            .await?;
        let raw = PairVolume::new(base_sum, quote_sum);
        if let Some(stamp) = stamp {
            self.pair_cache
                .store_unless_written(stamp, &client_key, &subject, from_ms, to_ms, raw);
        }
        Ok(raw.rounded())
    }

    fn clamp(&self, from_ms: u64, to_ms: u64) -> Option<u64> {
        let bound = self.watermark.query_bound()?;
        let to_ms = to_ms.min(bound);
        (to_ms > from_ms).then_some(to_ms)
    }
}

fn group_events(events: &[TradeEvent]) -> BTreeMap<GroupKey, Group<'_>> {
    let mut groups: BTreeMap<GroupKey, Group<'_>> = BTreeMap::new();
    for ev in events {
        let key = GroupKey {
            hour: hour_index(ev.ts_ms),
            asset_id: ev.asset_id.clone(),
            opposite_asset_id: ev.opposite_asset_id.clone(),
        };
        let g = groups.entry(key).or_insert_with(|| Group {
            time_ms: ev.ts_ms,
            events: Vec::new(),
        });
        g.time_ms = g.time_ms.max(ev.ts_ms);
        g.events.push(ev);
    }
    groups
}
