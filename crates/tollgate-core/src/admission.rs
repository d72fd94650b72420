//! Synchronous admission decisions.
//!
//! The gate consults the tier's circuit breaker first and only then the quota
//! ledger. An open circuit is the cheapest rejection: the ledger is not
//! touched at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::circuit::CircuitBreaker;
use crate::ledger::{QuotaLedger, QuotaViolation, UsageSnapshot};
use crate::window::Period;

/// Errors from the admission gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Unknown tier: '{0}'")]
    UnknownTier(String),
}

/// Ledger and breaker for one tier.
#[derive(Debug)]
pub struct QuotaScope {
    pub ledger: Arc<QuotaLedger>,
    pub breaker: Arc<CircuitBreaker>,
}

impl QuotaScope {
    pub fn new(ledger: Arc<QuotaLedger>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { ledger, breaker }
    }

    /// Tier name.
    pub fn name(&self) -> &str {
        self.ledger.tier_name()
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    CircuitOpen,
    Quota(QuotaViolation),
}

impl Rejection {
    /// Machine-readable error code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::CircuitOpen => "circuit_open",
            Rejection::Quota(_) => "quota_exceeded",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::CircuitOpen => f.write_str("circuit breaker open: usage at critical level"),
            Rejection::Quota(violation) => write!(f, "{}", violation),
        }
    }
}

/// Values for the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,

    /// Unix timestamp of the binding window's boundary
    pub reset: i64,
}

impl RateLimitInfo {
    /// Request budget of whichever window has fewer requests left.
    pub fn from_snapshot(snapshot: &UsageSnapshot, hourly_limit: u64, daily_limit: u64) -> Self {
        let hourly_left = hourly_limit.saturating_sub(snapshot.hourly.request_count);
        let daily_left = daily_limit.saturating_sub(snapshot.daily.request_count);
        if hourly_left <= daily_left {
            Self {
                limit: hourly_limit,
                remaining: hourly_left,
                reset: snapshot.hourly.window_end.timestamp(),
            }
        } else {
            Self {
                limit: daily_limit,
                remaining: daily_left,
                reset: snapshot.daily.window_end.timestamp(),
            }
        }
    }
}

/// Structured body returned with a 429.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub reason: String,
    pub usage: Option<UsageSnapshot>,
    pub retry_after: u64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub http_status: u16,
    pub rejection: Option<Rejection>,
    pub retry_after_seconds: u64,

    /// Absent when the circuit rejected without reading the ledger
    pub usage: Option<UsageSnapshot>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl Decision {
    /// Human-readable reason for a rejection.
    pub fn reason(&self) -> Option<String> {
        self.rejection.as_ref().map(ToString::to_string)
    }

    /// Response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(info) = self.rate_limit {
            headers.push(("X-RateLimit-Limit", info.limit.to_string()));
            headers.push(("X-RateLimit-Remaining", info.remaining.to_string()));
            headers.push(("X-RateLimit-Reset", info.reset.to_string()));
        }
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_seconds.to_string()));
        }
        headers
    }

    /// Body for a rejected request.
    pub fn rejection_body(&self) -> Option<RejectionBody> {
        self.rejection.as_ref().map(|rejection| RejectionBody {
            error: rejection.code().to_string(),
            reason: rejection.to_string(),
            usage: self.usage.clone(),
            retry_after: self.retry_after_seconds,
        })
    }
}

/// Composes each tier's circuit breaker and quota ledger.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    scopes: BTreeMap<String, Arc<QuotaScope>>,
}

impl AdmissionGate {
    /// Create a gate with no tiers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tier scope; replaces an existing scope of the same name.
    pub fn insert(&mut self, scope: Arc<QuotaScope>) {
        self.scopes.insert(scope.name().to_string(), scope);
    }

    /// Scope for a tier.
    pub fn scope(&self, tier: &str) -> Option<&Arc<QuotaScope>> {
        self.scopes.get(tier)
    }

    /// All scopes, ordered by tier name.
    pub fn scopes(&self) -> impl Iterator<Item = &Arc<QuotaScope>> {
        self.scopes.values()
    }

    /// Decide whether a request of the given estimated size may proceed.
    pub fn admit(
        &self,
        estimated_tokens: u64,
        estimated_cost: f64,
        tier: &str,
    ) -> Result<Decision, AdmissionError> {
        let scope = self
            .scopes
            .get(tier)
            .ok_or_else(|| AdmissionError::UnknownTier(tier.to_string()))?;

        if scope.breaker.is_open() {
            let retry_after = scope.breaker.retry_after_secs().unwrap_or_else(|| {
                let now = scope.ledger.now();
                let boundary = Period::Hourly.floor(now) + Period::Hourly.length();
                (boundary - now).num_seconds().max(1) as u64
            });
            tracing::debug!(tier = %tier, retry_after, "Admission rejected: circuit open");
            return Ok(Decision {
                allowed: false,
                http_status: 429,
                rejection: Some(Rejection::CircuitOpen),
                retry_after_seconds: retry_after.max(1),
                usage: None,
                rate_limit: None,
            });
        }

        let verdict = scope.ledger.check_allowance(estimated_tokens, estimated_cost);
        let usage = scope.ledger.current_usage();
        let t = scope.ledger.tier();
        let rate_limit = RateLimitInfo::from_snapshot(&usage, t.hourly_requests, t.daily_requests);

        match verdict {
            Ok(()) => Ok(Decision {
                allowed: true,
                http_status: 200,
                rejection: None,
                retry_after_seconds: 0,
                usage: Some(usage),
                rate_limit: Some(rate_limit),
            }),
            Err(violation) => {
                let retry_after = violation
                    .period()
                    .map(|p| usage.window(p).seconds_until_reset(usage.taken_at).max(1))
                    .unwrap_or(0);
                tracing::debug!(
                    tier = %tier,
                    reason = %violation,
                    retry_after,
                    "Admission rejected: quota"
                );
                Ok(Decision {
                    allowed: false,
                    http_status: 429,
                    rejection: Some(Rejection::Quota(violation)),
                    retry_after_seconds: retry_after,
                    usage: Some(usage),
                    rate_limit: Some(rate_limit),
                })
            }
        }
    }
}
