use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::buckets::{hour_floor, HOUR_MS};
use crate::types::{now_ms, round_volume, PairVolume};

/// Value held by a cached window.
pub trait WindowValue: Copy + Send + Sync + fmt::Debug + 'static {
    fn accumulate(&mut self, delta: Self);

    /// Serving form of the value (8 decimal places).
    fn rounded(self) -> Self;
}

impl WindowValue for f64 {
    fn accumulate(&mut self, delta: Self) {
        if delta.is_finite() {
            *self += delta;
        }
    }

    fn rounded(self) -> Self {
        round_volume(self)
    }
}

impl WindowValue for PairVolume {
    fn accumulate(&mut self, delta: Self) {
        if delta.base.is_finite() && delta.quote.is_finite() {
            *self += delta;
        }
    }

    fn rounded(self) -> Self {
        PairVolume::rounded(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct WindowEntry<V> {
    to_ms: u64,
    value: V,
}

type NodeKey = (String, String);
type WindowList<V> = Vec<WindowEntry<V>>;

/// Write generation seen by a reader before it computed a window from the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteStamp(u64);

/// Open ingest write on a cache; closes on drop.
#[must_use = "the write is closed when the epoch is dropped"]
pub struct WriteEpoch<'a> {
    writers: &'a AtomicUsize,
}

impl Drop for WriteEpoch<'_> {
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Read-through cache of range-query results keyed by `(client, subject, from)`.
///
/// One concurrent map keyed by the `(client, subject)` tuple; each node holds the windows of
/// that pair ordered by `from`. Per-shard locking only, no nested locks.
/// `reconcile` and `evict_expired` are not linearizable with `lookup`: a reader can observe a
/// reconciliation pass half-way.
///
/// A window computed from the store is only recorded through `store_unless_written` when no
/// ingest write opened (`begin_write`) since the reader took its `WriteStamp`; otherwise the
/// computed value may miss a delta whose reconciliation found no window to update.
pub struct VolumeCache<V: WindowValue> {
    name: &'static str,
    retention_ms: u64,
    client_warn_threshold: usize,
    windows: DashMap<NodeKey, BTreeMap<u64, WindowList<V>>>,
    /// Number of subject nodes per client.
    clients: DashMap<String, usize>,
    generation: AtomicU64,
    writers: AtomicUsize,
}

pub type AssetVolumeCache = VolumeCache<f64>;
pub type PairVolumeCache = VolumeCache<PairVolume>;

impl<V: WindowValue> VolumeCache<V> {
    pub fn new(name: &'static str, retention_ms: u64, client_warn_threshold: usize) -> Self {
        Self {
            name,
            retention_ms,
            client_warn_threshold,
            windows: DashMap::new(),
            clients: DashMap::new(),
            generation: AtomicU64::new(0),
            writers: AtomicUsize::new(0),
        }
    }

    /// Marks the start of an ingest write whose deltas will be pushed through `reconcile`.
    /// Keep the epoch alive until the last reconcile of the write.
    pub fn begin_write(&self) -> WriteEpoch<'_> {
        self.writers.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        WriteEpoch {
            writers: &self.writers,
        }
    }

    /// `None` while an ingest write is open.
    pub fn write_stamp(&self) -> Option<WriteStamp> {
        let generation = self.generation.load(Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) > 0 {
            return None;
        }
        Some(WriteStamp(generation))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn horizon(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.retention_ms)
    }

    pub fn lookup(&self, client: &str, subject: &str, from_ms: u64, to_ms: u64) -> Option<V> {
        self.lookup_at(now_ms(), client, subject, from_ms, to_ms)
    }

    /// Exact `(from, to)` match only; no interpolation across windows.
    pub fn lookup_at(
        &self,
        now_ms: u64,
        client: &str,
        subject: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> Option<V> {
        if from_ms < self.horizon(now_ms) {
            return None;
        }
        let node = self
            .windows
            .get(&(client.to_string(), subject.to_string()))?;
        let hit = node
            .get(&from_ms)?
            .iter()
            .find(|w| w.to_ms == to_ms)
            .map(|w| w.value.rounded());
        hit
    }

    /// Records a window. Several `to` values may coexist under one `from`; an existing
    /// `(from, to)` entry is kept as is since reconciliation already keeps it current.
    pub fn store_at(
        &self,
        now_ms: u64,
        client: &str,
        subject: &str,
        from_ms: u64,
        to_ms: u64,
        value: V,
    ) {
        self.insert_window(now_ms, client, subject, from_ms, to_ms, value, None);
    }

    /// Records a window at the current time, but drops the window when an ingest write opened after `stamp` was
    /// taken. Returns whether the window is cached.
    pub fn store_unless_written(
        &self,
        stamp: WriteStamp,
        client: &str,
        subject: &str,
        from_ms: u64,
        to_ms: u64,
        value: V,
    ) -> bool {
        self.insert_window(now_ms(), client, subject, from_ms, to_ms, value, Some(stamp))
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_window(
        &self,
        now_ms: u64,
        client: &str,
        subject: &str,
        from_ms: u64,
        to_ms: u64,
        value: V,
        stamp: Option<WriteStamp>,
    ) -> bool {
        if from_ms < self.horizon(now_ms) {
            debug!(
                cache = self.name,
                client,
                subject,
                from_ms,
                "window outside retention; not cached"
            );
            return false;
        }

        // The generation is checked while holding the node's shard lock, which `reconcile`
        // needs too: a write opening after the check reconciles into this window.
        let key = (client.to_string(), subject.to_string());
        let entry = self.windows.entry(key);
        if let Some(WriteStamp(seen)) = stamp {
            if self.generation.load(Ordering::SeqCst) != seen {
                debug!(
                    cache = self.name,
                    client,
                    subject,
                    from_ms,
                    "ingest wrote during the range sum; not cached"
                );
                return false;
            }
        }
        let created = match entry {
            Entry::Occupied(mut node) => {
                let list = node.get_mut().entry(from_ms).or_default();
                if !list.iter().any(|w| w.to_ms == to_ms) {
                    list.push(WindowEntry { to_ms, value });
                }
                false
            }
            Entry::Vacant(slot) => {
                let mut node = BTreeMap::new();
                node.insert(from_ms, vec![WindowEntry { to_ms, value }]);
                slot.insert(node);
                true
            }
        };

        if created {
            let new_client = {
                let mut n = self.clients.entry(client.to_string()).or_insert(0);
                *n += 1;
                *n == 1
            };
            if new_client {
                let count = self.clients.len();
                if count > self.client_warn_threshold {
                    warn!(
                        cache = self.name,
                        clients = count,
                        threshold = self.client_warn_threshold,
                        "unexpected number of cached clients"
                    );
                }
            }
        }
        true
    }

    /// Adds `delta` in place to every window of `(client, subject)` whose range covers the
    /// hour bucket of `event_time_ms`. Windows before or after it are untouched.
    ///
    /// Coverage follows the store's range sum: bucket `h` is inside `[from, to)` when
    /// `hour_floor(from) <= h < to`.
    pub fn reconcile(&self, client: &str, subject: &str, event_time_ms: u64, delta: V) -> usize {
        let Some(mut node) = self
            .windows
            .get_mut(&(client.to_string(), subject.to_string()))
        else {
            return 0;
        };

        let bucket = hour_floor(event_time_ms);
        let mut touched = 0usize;
        for (from_ms, list) in node.range_mut(..bucket + HOUR_MS) {
            if hour_floor(*from_ms) > bucket {
                continue;
            }
            for w in list.iter_mut().filter(|w| bucket < w.to_ms) {
                w.value.accumulate(delta);
                touched += 1;
            }
        }
        touched
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(now_ms())
    }

    /// Drops windows whose `from` precedes the retention horizon, then empty subject and
    /// client nodes. Returns the number of windows removed.
    pub fn evict_expired_at(&self, now_ms: u64) -> usize {
        let horizon = self.horizon(now_ms);
        let mut removed = 0usize;
        let mut emptied: Vec<String> = Vec::new();

        self.windows.retain(|(client, _subject), node| {
            let kept = node.split_off(&horizon);
            removed += node.values().map(|l| l.len()).sum::<usize>();
            *node = kept;
            if node.is_empty() {
                emptied.push(client.clone());
                false
            } else {
                true
            }
        });

        for client in emptied {
            if let Entry::Occupied(mut n) = self.clients.entry(client) {
                let left = n.get().saturating_sub(1);
                if left == 0 {
                    n.remove();
                } else {
                    *n.get_mut() = left;
                }
            }
        }

        if removed > 0 {
            debug!(cache = self.name, removed, horizon, "evicted expired windows");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn window_count(&self) -> usize {
        self.windows
            .iter()
            .map(|node| node.values().map(|l| l.len()).sum::<usize>())
            .sum()
    }
}

/// Cache that can be swept by the eviction task.
pub trait Evictable: Send + Sync {
    fn name(&self) -> &'static str;

    fn evict_expired(&self) -> usize;
}

impl<V: WindowValue> Evictable for VolumeCache<V> {
    fn name(&self) -> &'static str {
        VolumeCache::name(self)
    }

    fn evict_expired(&self) -> usize {
        VolumeCache::evict_expired(self)
    }
}
