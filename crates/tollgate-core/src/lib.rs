//! # tollgate-core
//!
//! Deterministic admission control for LLM gateways.
//!
//! This crate decides, before any upstream call is made, whether a request
//! may proceed:
//! - Does it fit the tier's hourly and daily quota?
//! - Is the tier's safety circuit open?
//! - When can the caller try again?
//!
//! ## Key Guarantees
//!
//! 1. **No network, no async**: every decision is synchronous and local
//! 2. **Serialized per tier**: one lock per ledger, tiers never contend
//! 3. **Inclusive limits**: usage equal to a limit blocks the next unit
//! 4. **Rebuildable**: windows can be reconstructed from the JSONL ledger
//!
//! ## Example
//!
//! ```rust,ignore
//! use tollgate_core::{AdmissionGate, GatewayConfig};
//!
//! let config = GatewayConfig::from_file("gateway.yaml")?;
//! let gate = build_gate(&config)?;
//!
//! let decision = gate.admit(1_200, 0.004, "free")?;
//! if !decision.allowed {
//!     println!("429: {} (retry in {}s)", decision.reason().unwrap_or_default(), decision.retry_after_seconds);
//! }
//! ```

pub mod admission;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod tier;
pub mod window;

// Re-export main types at crate root
pub use admission::{
    AdmissionError, AdmissionGate, Decision, QuotaScope, RateLimitInfo, Rejection, RejectionBody,
};
pub use circuit::{
    AuditEntry, CircuitBreaker, CircuitBreakerConfig, CircuitState, CooldownPolicy,
    OverrideAction,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AlertsConfig, ConfigError, GatewayConfig, LedgerConfig, ProviderEntry, RoutingConfig,
    TierSpec, TransportEntry,
};
pub use ledger::{
    LedgerError, LedgerRecord, LedgerStore, LoadedLedger, QuotaLedger, QuotaViolation,
    RecordStatus, UsagePercent, UsageSnapshot,
};
pub use tier::Tier;
pub use window::{Period, UsageWindow};
