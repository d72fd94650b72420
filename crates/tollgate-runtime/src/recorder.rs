//! Post-call usage recording.
//!
//! For every completed request, in order: append a ledger record, charge the
//! tier's windows, and let the circuit breaker look at the new usage. A
//! request id is only ever recorded once.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::{LedgerRecord, LedgerStore, QuotaScope, RecordStatus, UsageSnapshot};
use uuid::Uuid;

use crate::router::RequestOutcome;

const DEFAULT_DEDUPE_CAPACITY: u64 = 100_000;
const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What a `record` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    /// Usage was charged
    Charged {
        snapshot: UsageSnapshot,
        circuit_opened: bool,
    },

    /// This request id was already recorded; nothing changed
    Duplicate,

    /// The recording task panicked or was aborted by runtime shutdown
    Interrupted,
}

/// Writes actual usage back into the ledger.
pub struct UsageRecorder {
    store: Option<Arc<LedgerStore>>,
    seen: Cache<Uuid, ()>,
}

impl UsageRecorder {
    /// Recorder persisting to `store`, or in-memory only when `None`.
    pub fn new(store: Option<Arc<LedgerStore>>) -> Self {
        Self::with_dedupe(store, DEFAULT_DEDUPE_CAPACITY, DEFAULT_DEDUPE_TTL)
    }

    /// Recorder with an explicit duplicate-guard size and lifetime.
    pub fn with_dedupe(store: Option<Arc<LedgerStore>>, capacity: u64, ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { store, seen }
    }

    /// Record a completed request against a tier.
    ///
    /// The append, the window charge and the breaker evaluation run in a
    /// spawned task, so dropping the returned future does not stop them
    /// halfway.
    pub async fn record(
        &self,
        scope: &Arc<QuotaScope>,
        outcome: &RequestOutcome,
        tokens_used: u64,
        cost: f64,
        duration_ms: u64,
    ) -> Recorded {
        let status = if outcome.success {
            RecordStatus::Success
        } else if outcome.was_cancelled() {
            RecordStatus::Cancelled
        } else {
            RecordStatus::Failure
        };
        let usage = outcome.usage();
        let (request_tokens, response_tokens) = if usage.total() as u64 == tokens_used {
            (usage.prompt_tokens as u64, usage.completion_tokens as u64)
        } else {
            (tokens_used, 0)
        };

        let mut record = LedgerRecord::new(
            scope.ledger.now(),
            outcome.provider.as_deref().unwrap_or("none"),
            request_tokens,
            response_tokens,
            cost,
            duration_ms,
            status,
        )
        .with_metadata("tier", scope.name())
        .with_metadata("request_id", outcome.request_id.to_string())
        .with_metadata("attempts", outcome.attempts.len().to_string());
        if let Some(response) = &outcome.response {
            record = record.with_metadata("model", response.model.clone());
        }

        let request_id = outcome.request_id;
        let seen = self.seen.clone();
        let store = self.store.clone();
        let scope = scope.clone();
        let task = tokio::spawn(async move {
            let fresh = seen.entry(request_id).or_insert(()).await.is_fresh();
            if !fresh {
                tracing::debug!(request_id = %request_id, "Duplicate usage record ignored");
                return Recorded::Duplicate;
            }

            if let Some(store) = store {
                persist(store, record).await;
            }

            let snapshot = scope.ledger.record(tokens_used, cost, status);
            let circuit_opened = scope.breaker.evaluate(&snapshot);
            Recorded::Charged {
                snapshot,
                circuit_opened,
            }
        });

        match task.await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Usage recording task failed");
                Recorded::Interrupted
            }
        }
    }
}

/// Append off the async executor; a failed write is logged and the
/// in-memory counters are still charged.
async fn persist(store: Arc<LedgerStore>, record: LedgerRecord) {
    let request_id = record.metadata.get("request_id").cloned().unwrap_or_default();
    match tokio::task::spawn_blocking(move || store.append(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(request_id = %request_id, error = %e, "Failed to append ledger record");
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Ledger append task failed");
        }
    }
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder")
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
