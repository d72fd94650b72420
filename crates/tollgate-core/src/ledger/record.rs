//! Immutable per-request ledger records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a completed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// A provider produced a response
    Success,

    /// Every provider in the chain failed
    Failure,

    /// The caller cancelled mid-chain
    Cancelled,
}

/// One line of the persisted ledger.
///
/// Created once per completed request and never mutated. Field names on disk
/// are camelCase (`requestTokens`, `estimatedCost`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    /// When the request completed (ISO-8601)
    pub timestamp: DateTime<Utc>,

    /// Provider that served the request, or "none"
    pub provider: String,

    /// Prompt tokens billed
    pub request_tokens: u64,

    /// Completion tokens billed
    pub response_tokens: u64,

    /// `request_tokens + response_tokens`
    pub total_tokens: u64,

    /// Spend attributed to the request (USD)
    pub estimated_cost: f64,

    /// Wall time of the whole chain
    pub duration_ms: u64,

    pub status: RecordStatus,

    /// Free-form annotations (tier, request id, attempt count)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LedgerRecord {
    /// Create a record, deriving `total_tokens`.
    pub fn new(
        timestamp: DateTime<Utc>,
        provider: impl Into<String>,
        request_tokens: u64,
        response_tokens: u64,
        estimated_cost: f64,
        duration_ms: u64,
        status: RecordStatus,
    ) -> Self {
        Self {
            timestamp,
            provider: provider.into(),
            request_tokens,
            response_tokens,
            total_tokens: request_tokens.saturating_add(response_tokens),
            estimated_cost,
            duration_ms,
            status,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tier this record was charged to, if annotated.
    pub fn tier(&self) -> Option<&str> {
        self.metadata.get("tier").map(String::as_str)
    }
}
