//! Time-windowed usage counters.
//!
//! Windows are aligned to UTC period boundaries: hourly windows start on the
//! hour, daily windows start at midnight. `window_end` is always the exact
//! boundary of the period.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Length of a usage window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hourly,
    Daily,
}

impl Period {
    /// Duration of one period.
    pub fn length(self) -> Duration {
        match self {
            Period::Hourly => Duration::hours(1),
            Period::Daily => Duration::days(1),
        }
    }

    /// Start of the period containing `at`.
    pub fn floor(self, at: DateTime<Utc>) -> DateTime<Utc> {
        // duration_trunc only fails for out-of-range timestamps
        at.duration_trunc(self.length()).unwrap_or(at)
    }

    /// Label used in reasons and logs.
    pub fn label(self) -> &'static str {
        match self {
            Period::Hourly => "hourly",
            Period::Daily => "daily",
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub period: Period,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub request_count: u64,
    pub token_count: u64,
    pub cost_accumulated: f64,
}

impl UsageWindow {
    /// Fresh, zeroed window for the period containing `now`.
    pub fn starting_at(period: Period, now: DateTime<Utc>) -> Self {
        let window_start = period.floor(now);
        Self {
            period,
            window_start,
            window_end: window_start + period.length(),
            request_count: 0,
            token_count: 0,
            cost_accumulated: 0.0,
        }
    }

    /// Whether `now` lies at or past the window boundary.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }

    /// Reset if expired. Returns true when a reset happened.
    ///
    /// Any number of elapsed periods collapse into a single reset onto the
    /// period that contains `now`.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_expired(now) {
            return false;
        }
        *self = Self::starting_at(self.period, now);
        true
    }

    /// Whether `at` falls inside this window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.window_start && at < self.window_end
    }

    /// Add one completed request.
    pub fn add(&mut self, tokens: u64, cost: f64) {
        self.request_count += 1;
        self.token_count = self.token_count.saturating_add(tokens);
        self.cost_accumulated += cost.max(0.0);
    }

    /// Seconds until the window boundary, rounded up.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.window_end - now;
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_windows_align_to_boundaries() {
        let hourly = UsageWindow::starting_at(Period::Hourly, at(13, 42, 7));
        assert_eq!(hourly.window_start, at(13, 0, 0));
        assert_eq!(hourly.window_end, at(14, 0, 0));

        let daily = UsageWindow::starting_at(Period::Daily, at(13, 42, 7));
        assert_eq!(daily.window_start, at(0, 0, 0));
        assert_eq!(daily.window_end, at(0, 0, 0) + Duration::days(1));
    }

    #[test]
    fn test_boundary_instant_is_expired() {
        let window = UsageWindow::starting_at(Period::Hourly, at(9, 30, 0));
        assert!(!window.is_expired(at(9, 59, 59)));
        assert!(window.is_expired(at(10, 0, 0)));
    }

    #[test]
    fn test_many_elapsed_periods_collapse_into_one_reset() {
        let mut window = UsageWindow::starting_at(Period::Hourly, at(1, 15, 0));
        window.add(100, 0.5);

        assert!(window.roll_over(at(7, 5, 0)));
        assert_eq!(window.window_start, at(7, 0, 0));
        assert_eq!(window.window_end, at(8, 0, 0));
        assert_eq!(window.request_count, 0);
        assert_eq!(window.token_count, 0);
        assert_eq!(window.cost_accumulated, 0.0);

        // Second access in the same period is a no-op
        assert!(!window.roll_over(at(7, 6, 0)));
    }

    #[test]
    fn test_seconds_until_reset_rounds_up() {
        let window = UsageWindow::starting_at(Period::Hourly, at(9, 0, 0));
        let now = at(9, 59, 59) + Duration::milliseconds(1);
        assert_eq!(window.seconds_until_reset(now), 1);
        assert_eq!(window.seconds_until_reset(at(10, 0, 0)), 0);
    }

    proptest! {
        #[test]
        fn prop_rollover_always_lands_on_period_containing_now(
            offset_secs in 0i64..(40 * 24 * 3600),
            daily in any::<bool>(),
        ) {
            let period = if daily { Period::Daily } else { Period::Hourly };
            let mut window = UsageWindow::starting_at(period, at(0, 0, 0));
            window.add(10, 0.1);
            let now = at(0, 0, 0) + Duration::seconds(offset_secs);

            window.roll_over(now);

            prop_assert!(window.contains(now));
            prop_assert_eq!(window.window_end - window.window_start, period.length());
            prop_assert!(!window.roll_over(now));
        }
    }
}
