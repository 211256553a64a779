//! Unit system (frozen):
//! - All timestamps are **unix milliseconds** (`u64`), UTC.
//! - Volumes are analytical `f64` quantities; query results are rounded to 8 decimal places
//!   (`round_volume`) at the serving edge only. Stored cumulative values are never rounded.

use std::borrow::Cow;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sentinel client id meaning "aggregate across all clients".
pub const WILDCARD_CLIENT: &str = "all";

/// Query-side prefix addressing a wallet instead of a user, e.g. `wallet:w-17`.
pub const WALLET_PREFIX: &str = "wallet:";

pub const VOLUME_DECIMALS: i32 = 8;

/// One observed trade leg: `volume` of `asset_id` traded for `opposite_volume` of
/// `opposite_asset_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub asset_id: String,
    pub volume: f64,
    pub opposite_asset_id: String,
    /// Absent for one-sided legs; counts as zero.
    #[serde(default)]
    pub opposite_volume: Option<f64>,
    pub ts_ms: u64,
    #[serde(default)]
    pub hidden: bool,
}

impl TradeEvent {
    pub fn leg(&self) -> LegVolume {
        LegVolume {
            volume: sanitize_volume(self.volume),
            counter_volume: self.opposite_volume.map(sanitize_volume).unwrap_or(0.0),
        }
    }
}

/// One message of the inbound channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBatch {
    pub batch_id: String,
    pub events: Vec<TradeEvent>,
}

impl TradeBatch {
    pub fn max_ts_ms(&self) -> Option<u64> {
        self.events.iter().map(|e| e.ts_ms).max()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    User,
    Wallet,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Wallet => "wallet",
        }
    }
}

/// Volume of one asset traded against a counter asset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LegVolume {
    pub volume: f64,
    pub counter_volume: f64,
}

impl LegVolume {
    pub const ZERO: LegVolume = LegVolume {
        volume: 0.0,
        counter_volume: 0.0,
    };

    /// The same leg seen from the counter asset's side.
    pub fn mirrored(self) -> LegVolume {
        LegVolume {
            volume: self.counter_volume,
            counter_volume: self.volume,
        }
    }
}

impl Add for LegVolume {
    type Output = LegVolume;

    fn add(self, rhs: LegVolume) -> Self::Output {
        LegVolume {
            volume: self.volume + rhs.volume,
            counter_volume: self.counter_volume + rhs.counter_volume,
        }
    }
}

impl AddAssign for LegVolume {
    fn add_assign(&mut self, rhs: LegVolume) {
        self.volume += rhs.volume;
        self.counter_volume += rhs.counter_volume;
    }
}

/// Base/quoting volumes of an asset pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PairVolume {
    pub base: f64,
    pub quote: f64,
}

impl PairVolume {
    pub fn new(base: f64, quote: f64) -> Self {
        Self { base, quote }
    }

    pub fn rounded(self) -> Self {
        Self {
            base: round_volume(self.base),
            quote: round_volume(self.quote),
        }
    }
}

impl AddAssign for PairVolume {
    fn add_assign(&mut self, rhs: PairVolume) {
        self.base += rhs.base;
        self.quote += rhs.quote;
    }
}

impl From<LegVolume> for PairVolume {
    fn from(leg: LegVolume) -> Self {
        PairVolume {
            base: leg.volume,
            quote: leg.counter_volume,
        }
    }
}

/// Client selector of a volume query. Users and wallets are separate subjects even when their
/// ids coincide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientSelector {
    All,
    Client(String),
    Wallet(String),
}

impl ClientSelector {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(WILDCARD_CLIENT) {
            ClientSelector::All
        } else if let Some(wallet) = raw.strip_prefix(WALLET_PREFIX) {
            ClientSelector::Wallet(wallet.to_string())
        } else {
            ClientSelector::Client(raw.to_string())
        }
    }

    /// The single subject addressed, `None` for the wildcard.
    pub fn subject(&self) -> Option<(SubjectKind, &str)> {
        match self {
            ClientSelector::All => None,
            ClientSelector::Client(id) => Some((SubjectKind::User, id)),
            ClientSelector::Wallet(id) => Some((SubjectKind::Wallet, id)),
        }
    }

    /// Key used for cache entries.
    pub fn cache_key(&self) -> Cow<'_, str> {
        match self.subject() {
            None => Cow::Borrowed(WILDCARD_CLIENT),
            Some((kind, id)) => subject_cache_key(kind, id),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ClientSelector::All)
    }
}

impl fmt::Display for ClientSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// Cache client key of one subject; matches `ClientSelector::cache_key` of its selector.
pub fn subject_cache_key(kind: SubjectKind, id: &str) -> Cow<'_, str> {
    match kind {
        SubjectKind::User => Cow::Borrowed(id),
        SubjectKind::Wallet => Cow::Owned(format!("{WALLET_PREFIX}{id}")),
    }
}

/// Subject key under which pair volumes are cached.
pub fn pair_subject_key(base_asset_id: &str, quoting_asset_id: &str) -> String {
    format!("{base_asset_id}/{quoting_asset_id}")
}

pub fn round_volume(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    let scale = 10f64.powi(VOLUME_DECIMALS);
    (v * scale).round() / scale
}

fn sanitize_volume(v: f64) -> f64 {
    if !v.is_finite() || v < 0.0 {
        0.0
    } else {
        v
    }
}

pub fn now_ms() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_millis() as u64
}
