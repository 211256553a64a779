use parking_lot::Mutex;

use crate::buckets::hour_floor;

/// Result of advancing the watermark with one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub previous: Option<u64>,
    pub current: u64,
    /// Set when the batch jumped the watermark by at least the warning delay and no warning
    /// was emitted within the rate-limit interval.
    pub stale_warning: bool,
}

#[derive(Debug, Default)]
struct State {
    current: Option<u64>,
    last_warning_ms: Option<u64>,
}

/// Maximum event timestamp processed so far. Absent until the first batch commits; never moves
/// backwards.
#[derive(Debug)]
pub struct Watermark {
    warning_delay_ms: u64,
    warning_interval_ms: u64,
    state: Mutex<State>,
}

impl Watermark {
    pub fn new(warning_delay_ms: u64, warning_interval_ms: u64) -> Self {
        Self {
            warning_delay_ms,
            warning_interval_ms,
            state: Mutex::new(State::default()),
        }
    }

    pub fn get(&self) -> Option<u64> {
        self.state.lock().current
    }

    /// Upper bound any query `to` is clamped to: the watermark rounded down to the hour.
    pub fn query_bound(&self) -> Option<u64> {
        self.get().map(hour_floor)
    }

    pub fn advance(&self, batch_max_ts_ms: u64, now_ms: u64) -> Advance {
        let mut st = self.state.lock();
        let previous = st.current;
        let current = previous.map_or(batch_max_ts_ms, |p| p.max(batch_max_ts_ms));
        st.current = Some(current);

        let mut stale_warning = false;
        if let Some(prev) = previous {
            let lag = batch_max_ts_ms.saturating_sub(prev);
            let quiet = st
                .last_warning_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= self.warning_interval_ms);
            if lag >= self.warning_delay_ms && quiet {
                st.last_warning_ms = Some(now_ms);
                stale_warning = true;
            }
        }

        Advance {
            previous,
            current,
            stale_warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::HOUR_MS;

    #[test]
    fn starts_absent_and_never_moves_back() {
        let wm = Watermark::new(u64::MAX, 60_000);
        assert_eq!(wm.get(), None);
        assert_eq!(wm.query_bound(), None);

        wm.advance(5 * HOUR_MS + 10, 0);
        wm.advance(2 * HOUR_MS, 0);
        assert_eq!(wm.get(), Some(5 * HOUR_MS + 10));
        assert_eq!(wm.query_bound(), Some(5 * HOUR_MS));
    }

    #[test]
    fn first_batch_never_warns() {
        let wm = Watermark::new(0, 60_000);
        let adv = wm.advance(1_000, 0);
        assert_eq!(adv.previous, None);
        assert!(!adv.stale_warning);
    }

    #[test]
    fn staleness_warning_is_rate_limited() {
        let wm = Watermark::new(10_000, 60_000);
        wm.advance(0, 0);

        assert!(wm.advance(20_000, 1_000).stale_warning);
        // Large jump again, but inside the one-minute quiet period.
        assert!(!wm.advance(40_000, 30_000).stale_warning);
        assert!(wm.advance(60_000, 61_000).stale_warning);
        // Small step: never a warning.
        assert!(!wm.advance(61_000, 200_000).stale_warning);
    }
}
