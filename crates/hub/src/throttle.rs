//! Log admission policy: at most `max_logs` history entries per entity in any
//! rolling window of length `interval`.
//!
//! With `max_logs == 1` this is the same rule as "at least `interval`
//! between two logs": a log at `t0` leaves the window `(now - interval, now]`
//! exactly when `now - t0 >= interval`.

use std::time::Duration;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_LOGS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub interval: Duration,
    pub max_logs: u32,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_logs: DEFAULT_MAX_LOGS,
        }
    }
}

impl ThrottlePolicy {
    pub fn new(interval: Duration, max_logs: u32) -> Self {
        Self { interval, max_logs }
    }

    pub fn interval_ms(&self) -> i64 {
        i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX)
    }

    /// Exclusive lower bound of the window ending at `now_ms`.
    pub fn window_start(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.interval_ms())
    }

    /// Decision given the number of logs already inside the window.
    pub fn should_log(&self, recent_count: u32) -> bool {
        recent_count < self.max_logs
    }

    /// True when the last known log alone proves the window is full.
    /// Only meaningful for single-log windows; never admits anything.
    pub fn rejects_cached(&self, last_log_ts: Option<i64>, now_ms: i64) -> bool {
        let inside = last_log_ts.is_some_and(|t| now_ms.saturating_sub(t) < self.interval_ms());
        inside && !self.should_log(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;

    fn five_minutes(max_logs: u32) -> ThrottlePolicy {
        ThrottlePolicy::new(Duration::from_secs(300), max_logs)
    }

    #[test]
    fn default_is_one_log_per_five_minutes() {
        let p = ThrottlePolicy::default();
        assert_eq!(p.interval_ms(), 5 * MIN);
        assert_eq!(p.max_logs, 1);
    }

    #[test]
    fn window_start_subtracts_interval() {
        assert_eq!(five_minutes(1).window_start(10 * MIN), 5 * MIN);
    }

    #[test]
    fn should_log_below_limit() {
        let p = five_minutes(3);
        assert!(p.should_log(0));
        assert!(p.should_log(2));
        assert!(!p.should_log(3));
        assert!(!p.should_log(10));
    }

    #[test]
    fn cached_rejection_inside_window() {
        let p = five_minutes(1);
        assert!(p.rejects_cached(Some(0), 1_000));
        assert!(p.rejects_cached(Some(0), 5 * MIN - 1));
    }

    #[test]
    fn cached_rejection_ends_at_interval_boundary() {
        let p = five_minutes(1);
        assert!(!p.rejects_cached(Some(0), 5 * MIN));
        assert!(!p.rejects_cached(Some(0), 6 * MIN));
    }

    #[test]
    fn cached_rejection_needs_a_known_log() {
        assert!(!five_minutes(1).rejects_cached(None, 0));
    }

    #[test]
    fn cached_rejection_disabled_for_multi_log_windows() {
        assert!(!five_minutes(5).rejects_cached(Some(0), 1_000));
    }
}
