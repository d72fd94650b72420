//! Time-windowed quota ledger.
//!
//! One `QuotaLedger` exists per tier. It owns an hourly and a daily
//! [`UsageWindow`] behind a single lock, so every mutation on one ledger is
//! serialized while independent tiers never contend.

mod record;
mod store;

pub use record::{LedgerRecord, RecordStatus};
pub use store::{LedgerError, LedgerStore, LoadedLedger};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::clock::Clock;
use crate::tier::Tier;
use crate::window::{Period, UsageWindow};

/// Why a request does not fit the remaining quota.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuotaViolation {
    #[error("request exceeds per-request token cap ({max})")]
    RequestTokens { requested: u64, max: u64 },

    #[error("request exceeds per-request cost cap (${max:.4})")]
    RequestCost { requested: f64, max: f64 },

    #[error("{period} request limit reached ({limit})")]
    Requests { period: Period, limit: u64 },

    #[error("{period} token limit reached ({limit})")]
    Tokens { period: Period, limit: u64 },

    #[error("{period} cost limit reached (${limit:.2})")]
    Cost { period: Period, limit: f64 },
}

impl QuotaViolation {
    /// Window whose boundary lifts this violation, if any.
    ///
    /// Per-request caps are independent of remaining quota, so waiting never
    /// helps them.
    pub fn period(&self) -> Option<Period> {
        match self {
            QuotaViolation::RequestTokens { .. } | QuotaViolation::RequestCost { .. } => None,
            QuotaViolation::Requests { period, .. }
            | QuotaViolation::Tokens { period, .. }
            | QuotaViolation::Cost { period, .. } => Some(*period),
        }
    }
}

/// Percent of each limit consumed in one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsagePercent {
    pub requests: f64,
    pub tokens: f64,
    pub cost: f64,
}

impl UsagePercent {
    /// The worst of the three.
    pub fn worst(&self) -> f64 {
        self.requests.max(self.tokens).max(self.cost)
    }
}

/// Point-in-time view of a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub taken_at: DateTime<Utc>,
    pub hourly: UsageWindow,
    pub daily: UsageWindow,
    pub hourly_percent: UsagePercent,
    pub daily_percent: UsagePercent,
}

impl UsageSnapshot {
    /// Window for a period.
    pub fn window(&self, period: Period) -> &UsageWindow {
        match period {
            Period::Hourly => &self.hourly,
            Period::Daily => &self.daily,
        }
    }

    /// Percentages for a period.
    pub fn percent(&self, period: Period) -> UsagePercent {
        match period {
            Period::Hourly => self.hourly_percent,
            Period::Daily => self.daily_percent,
        }
    }

    /// Worst percentage across both windows, with the window it came from.
    pub fn worst(&self) -> (Period, f64) {
        let hourly = self.hourly_percent.worst();
        let daily = self.daily_percent.worst();
        if daily >= hourly {
            (Period::Daily, daily)
        } else {
            (Period::Hourly, hourly)
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    hourly: UsageWindow,
    daily: UsageWindow,
}

impl LedgerState {
    fn roll_over(&mut self, now: DateTime<Utc>, tier_name: &str) -> u64 {
        let mut resets = 0;
        for window in [&mut self.hourly, &mut self.daily] {
            if window.roll_over(now) {
                resets += 1;
                tracing::debug!(
                    tier = %tier_name,
                    period = %window.period,
                    window_start = %window.window_start,
                    "Usage window rolled over"
                );
            }
        }
        resets
    }
}

/// Serialized usage counters for one tier.
pub struct QuotaLedger {
    tier_name: String,
    tier: Tier,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
    allowance_checks: AtomicU64,
    rollovers: AtomicU64,
}

impl QuotaLedger {
    /// Create an empty ledger.
    pub fn new(tier_name: impl Into<String>, tier: Tier, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            tier_name: tier_name.into(),
            tier,
            clock,
            state: Mutex::new(LedgerState {
                hourly: UsageWindow::starting_at(Period::Hourly, now),
                daily: UsageWindow::starting_at(Period::Daily, now),
            }),
            allowance_checks: AtomicU64::new(0),
            rollovers: AtomicU64::new(0),
        }
    }

    /// Rebuild windows from persisted records.
    ///
    /// Only records that fall inside the current hourly/daily windows count;
    /// everything older is history.
    pub fn from_records<'a>(
        tier_name: impl Into<String>,
        tier: Tier,
        clock: Arc<dyn Clock>,
        records: impl IntoIterator<Item = &'a LedgerRecord>,
    ) -> Self {
        let ledger = Self::new(tier_name, tier, clock);
        {
            let state = &mut *ledger.state.lock();
            for record in records {
                for window in [&mut state.hourly, &mut state.daily] {
                    if window.contains(record.timestamp) {
                        window.add(record.total_tokens, record.estimated_cost);
                    }
                }
            }
        }
        ledger
    }

    /// Tier name this ledger charges.
    pub fn tier_name(&self) -> &str {
        &self.tier_name
    }

    /// Tier limits.
    pub fn tier(&self) -> &Tier {
        &self.tier
    }

    /// Current time according to the ledger's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Check whether a request of the given estimated size fits.
    ///
    /// Order: per-request caps, then hourly, then daily. The first violated
    /// limit is returned.
    pub fn check_allowance(
        &self,
        estimated_tokens: u64,
        estimated_cost: f64,
    ) -> Result<(), QuotaViolation> {
        self.allowance_checks.fetch_add(1, Ordering::SeqCst);
        let tier = &self.tier;

        if estimated_tokens > tier.max_request_tokens {
            return Err(QuotaViolation::RequestTokens {
                requested: estimated_tokens,
                max: tier.max_request_tokens,
            });
        }
        if estimated_cost > tier.max_request_cost {
            return Err(QuotaViolation::RequestCost {
                requested: estimated_cost,
                max: tier.max_request_cost,
            });
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        let resets = state.roll_over(now, &self.tier_name);
        if resets > 0 {
            self.rollovers.fetch_add(resets, Ordering::SeqCst);
        }

        check_window(
            &state.hourly,
            tier.hourly_requests,
            tier.hourly_tokens,
            tier.hourly_cost_limit,
            estimated_tokens,
            estimated_cost,
        )?;
        check_window(
            &state.daily,
            tier.daily_requests,
            tier.daily_tokens,
            tier.daily_cost_limit,
            estimated_tokens,
            estimated_cost,
        )
    }

    /// Charge a completed request to both windows.
    ///
    /// Returns the snapshot taken right after the update, under the same lock.
    pub fn record(&self, actual_tokens: u64, actual_cost: f64, status: RecordStatus) -> UsageSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let resets = state.roll_over(now, &self.tier_name);
        if resets > 0 {
            self.rollovers.fetch_add(resets, Ordering::SeqCst);
        }

        state.hourly.add(actual_tokens, actual_cost);
        state.daily.add(actual_tokens, actual_cost);

        tracing::trace!(
            tier = %self.tier_name,
            tokens = actual_tokens,
            cost = actual_cost,
            status = ?status,
            "Usage recorded"
        );

        self.snapshot_locked(&state, now)
    }

    /// Snapshot of both windows, rolling over expired ones first.
    pub fn current_usage(&self) -> UsageSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let resets = state.roll_over(now, &self.tier_name);
        if resets > 0 {
            self.rollovers.fetch_add(resets, Ordering::SeqCst);
        }
        self.snapshot_locked(&state, now)
    }

    /// Number of `check_allowance` calls served.
    pub fn allowance_checks(&self) -> u64 {
        self.allowance_checks.load(Ordering::SeqCst)
    }

    /// Number of window resets performed.
    pub fn rollovers(&self) -> u64 {
        self.rollovers.load(Ordering::SeqCst)
    }

    fn snapshot_locked(&self, state: &LedgerState, now: DateTime<Utc>) -> UsageSnapshot {
        let tier = &self.tier;
        UsageSnapshot {
            taken_at: now,
            hourly_percent: UsagePercent {
                requests: percent(state.hourly.request_count as f64, tier.hourly_requests as f64),
                tokens: percent(state.hourly.token_count as f64, tier.hourly_tokens as f64),
                cost: percent(state.hourly.cost_accumulated, tier.hourly_cost_limit),
            },
            daily_percent: UsagePercent {
                requests: percent(state.daily.request_count as f64, tier.daily_requests as f64),
                tokens: percent(state.daily.token_count as f64, tier.daily_tokens as f64),
                cost: percent(state.daily.cost_accumulated, tier.daily_cost_limit),
            },
            hourly: state.hourly.clone(),
            daily: state.daily.clone(),
        }
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("tier_name", &self.tier_name)
            .field("tier", &self.tier)
            .finish()
    }
}

fn check_window(
    window: &UsageWindow,
    max_requests: u64,
    max_tokens: u64,
    max_cost: f64,
    estimated_tokens: u64,
    estimated_cost: f64,
) -> Result<(), QuotaViolation> {
    let period = window.period;

    if window.request_count >= max_requests {
        return Err(QuotaViolation::Requests {
            period,
            limit: max_requests,
        });
    }
    if window.token_count >= max_tokens
        || window.token_count.saturating_add(estimated_tokens) > max_tokens
    {
        return Err(QuotaViolation::Tokens {
            period,
            limit: max_tokens,
        });
    }
    if window.cost_accumulated >= max_cost || window.cost_accumulated + estimated_cost > max_cost {
        return Err(QuotaViolation::Cost {
            period,
            limit: max_cost,
        });
    }
    Ok(())
}

/// `used / limit` as a percentage; a zero limit counts as fully consumed.
fn percent(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        100.0
    } else {
        used / limit * 100.0
    }
}
