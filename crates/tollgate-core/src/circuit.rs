//! Usage-driven circuit breaker.
//!
//! When the worst usage percentage of a tier crosses the critical threshold,
//! the circuit opens and every admission for that tier is rejected until the
//! cooldown elapses. Operators can force the circuit either way; every manual
//! action is written to the audit log.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::ledger::UsageSnapshot;
use crate::window::Period;

/// Default critical usage percentage.
pub const DEFAULT_CRITICAL_THRESHOLD: f64 = 95.0;

/// How long an opened circuit stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CooldownPolicy {
    /// Until the boundary of the window that tripped the breaker
    #[default]
    NextWindow,

    /// A fixed duration from the moment it opened
    Fixed(std::time::Duration),
}

impl Serialize for CooldownPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CooldownPolicy::NextWindow => serializer.serialize_str("next_window"),
            CooldownPolicy::Fixed(d) => {
                serializer.collect_str(&humantime::format_duration(*d))
            }
        }
    }
}

impl<'de> Deserialize<'de> for CooldownPolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "next_window" {
            return Ok(CooldownPolicy::NextWindow);
        }
        humantime::parse_duration(&raw)
            .map(CooldownPolicy::Fixed)
            .map_err(|e| serde::de::Error::custom(format!("invalid cooldown '{}': {}", raw, e)))
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Worst usage percentage that opens the circuit
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,

    #[serde(default)]
    pub cooldown: CooldownPolicy,
}

fn default_critical_threshold() -> f64 {
    DEFAULT_CRITICAL_THRESHOLD
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            cooldown: CooldownPolicy::NextWindow,
        }
    }
}

/// Observable state of a circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub is_open: bool,
    pub opened_at: Option<DateTime<Utc>>,

    /// `None` while open only under a manual override
    pub cooldown_until: Option<DateTime<Utc>>,

    pub forced: bool,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            is_open: false,
            opened_at: None,
            cooldown_until: None,
            forced: false,
        }
    }
}

/// Manual override actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    ForceOpen,
    ForceClose,
}

/// Audit trail entry for a manual override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub operator: String,
    pub action: OverrideAction,
    pub reason: String,
}

/// Binary safety gate for one tier.
pub struct CircuitBreaker {
    scope: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl CircuitBreaker {
    /// Create a closed circuit.
    pub fn new(scope: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            scope: scope.into(),
            config,
            clock,
            state: Mutex::new(CircuitState::closed()),
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether admissions must be rejected right now.
    ///
    /// Closes the circuit as a side effect once the cooldown has elapsed.
    pub fn is_open(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        state.is_open
    }

    /// Current state, after applying any due auto-close.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        state.clone()
    }

    /// Seconds until an open circuit closes by itself.
    ///
    /// `None` when closed or when held open by an operator.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if !state.is_open {
            return None;
        }
        state.cooldown_until.map(|until| {
            let millis = (until - now).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000)
        })
    }

    /// Open the circuit if the snapshot's worst usage crosses the threshold.
    ///
    /// Returns true when this call opened it.
    pub fn evaluate(&self, snapshot: &UsageSnapshot) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.is_open {
            return false;
        }

        let (period, worst) = snapshot.worst();
        if worst < self.config.critical_threshold {
            return false;
        }

        let cooldown_until = self.cooldown_until(snapshot, period, now);
        *state = CircuitState {
            is_open: true,
            opened_at: Some(now),
            cooldown_until: Some(cooldown_until),
            forced: false,
        };
        tracing::warn!(
            scope = %self.scope,
            period = %period,
            usage_percent = worst,
            threshold = self.config.critical_threshold,
            cooldown_until = %cooldown_until,
            "Circuit opened: usage crossed critical threshold"
        );
        true
    }

    /// Hold the circuit open until an operator closes it.
    pub fn force_open(&self, operator: &str, reason: &str) {
        let now = self.clock.now();
        *self.state.lock() = CircuitState {
            is_open: true,
            opened_at: Some(now),
            cooldown_until: None,
            forced: true,
        };
        self.audit(now, operator, OverrideAction::ForceOpen, reason);
    }

    /// Close the circuit immediately.
    pub fn force_close(&self, operator: &str, reason: &str) {
        let now = self.clock.now();
        *self.state.lock() = CircuitState::closed();
        self.audit(now, operator, OverrideAction::ForceClose, reason);
    }

    /// Manual overrides performed so far.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }

    fn refresh(&self, state: &mut CircuitState, now: DateTime<Utc>) {
        if !state.is_open || state.forced {
            return;
        }
        if let Some(until) = state.cooldown_until {
            if now >= until {
                *state = CircuitState::closed();
                tracing::info!(scope = %self.scope, "Circuit closed after cooldown");
            }
        }
    }

    fn cooldown_until(
        &self,
        snapshot: &UsageSnapshot,
        period: Period,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match self.config.cooldown {
            CooldownPolicy::NextWindow => snapshot.window(period).window_end,
            CooldownPolicy::Fixed(d) => {
                now + Duration::from_std(d).unwrap_or_else(|_| Duration::hours(1))
            }
        }
    }

    fn audit(&self, now: DateTime<Utc>, operator: &str, action: OverrideAction, reason: &str) {
        tracing::warn!(
            target: "tollgate::audit",
            scope = %self.scope,
            operator = %operator,
            action = ?action,
            reason = %reason,
            "Manual circuit override"
        );
        self.audit.lock().push(AuditEntry {
            at: now,
            operator: operator.to_string(),
            action,
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("scope", &self.scope)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}
