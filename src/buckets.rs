//! Hour buckets and UTC dates. Everything is integer unix milliseconds.

use chrono::{DateTime, NaiveDate};

pub const HOUR_MS: u64 = 3_600_000;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Truncates to the top of the hour.
pub fn hour_floor(ts_ms: u64) -> u64 {
    ts_ms - ts_ms % HOUR_MS
}

/// Hours since epoch. Distinct for the same hour-of-day on different dates.
pub fn hour_index(ts_ms: u64) -> u64 {
    ts_ms / HOUR_MS
}

/// Start of every whole hour bucket in `[from_ms, to_ms)`.
pub fn hours_in_range(from_ms: u64, to_ms: u64) -> impl Iterator<Item = u64> {
    let start = hour_floor(from_ms);
    let end = if to_ms > start { to_ms } else { start };
    (start..end).step_by(HOUR_MS as usize)
}

pub fn utc_date(ts_ms: u64) -> NaiveDate {
    DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

/// Unix ms of `date` 00:00 UTC; dates before the epoch clamp to 0.
pub fn day_start_ms(date: NaiveDate) -> u64 {
    let ms = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0);
    ms.max(0) as u64
}

pub fn spans_day_boundary(min_ts_ms: u64, max_ts_ms: u64) -> bool {
    min_ts_ms / DAY_MS != max_ts_ms / DAY_MS
}
