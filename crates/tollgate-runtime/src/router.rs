//! Sequential provider fallback.
//!
//! One routing call walks a snapshot of the registry order and tries each
//! provider at most once, under a per-attempt timeout. Every attempt becomes
//! an [`AttemptRecord`]; an error exists only once the chain is exhausted or
//! cancelled.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::providers::{
    AttemptClass, GenerationOptions, GenerationProvider, GenerationResponse, ProviderError,
    TokenUsage,
};
use crate::registry::{ProviderDescriptor, ProviderRegistry};

/// One provider attempt inside a routing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub class: AttemptClass,

    /// Provider error text for failed attempts
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.class == AttemptClass::Success
    }
}

/// Terminal routing failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("No enabled providers")]
    NoProviders,

    #[error("All providers exhausted after {} attempts", attempts.len())]
    AllProvidersExhausted { attempts: Vec<AttemptRecord> },

    #[error("Cancelled after {} attempts", attempts.len())]
    Cancelled { attempts: Vec<AttemptRecord> },
}

impl RouterError {
    /// Attempts made before the chain ended.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            RouterError::NoProviders => &[],
            RouterError::AllProvidersExhausted { attempts } | RouterError::Cancelled { attempts } => {
                attempts
            }
        }
    }
}

/// Result of one routing call.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: Uuid,

    /// Provider that produced the response
    pub provider: Option<String>,
    pub success: bool,
    pub attempts: Vec<AttemptRecord>,
    pub final_error: Option<RouterError>,
    pub response: Option<GenerationResponse>,

    /// Wall time of the whole chain
    pub duration: Duration,
}

impl RequestOutcome {
    /// Tokens the serving provider billed; zero when nothing succeeded.
    pub fn usage(&self) -> TokenUsage {
        self.response
            .as_ref()
            .map(|r| r.usage.clone())
            .unwrap_or_default()
    }

    /// Failed attempts that preceded the final one.
    pub fn fallback_attempts(&self) -> Vec<AttemptRecord> {
        self.attempts
            .iter()
            .filter(|a| !a.succeeded())
            .cloned()
            .collect()
    }

    /// Whether the caller cancelled the chain.
    pub fn was_cancelled(&self) -> bool {
        matches!(self.final_error, Some(RouterError::Cancelled { .. }))
    }

    /// Response on success, terminal error otherwise.
    pub fn into_result(self) -> Result<GenerationResponse, RouterError> {
        match (self.response, self.final_error) {
            (Some(response), _) => Ok(response),
            (None, Some(error)) => Err(error),
            (None, None) => Err(RouterError::AllProvidersExhausted {
                attempts: self.attempts,
            }),
        }
    }
}

/// Executes generation requests across the registry's providers.
pub struct FallbackRouter {
    registry: Arc<ProviderRegistry>,
    default_timeout: Duration,
}

impl FallbackRouter {
    pub fn new(registry: Arc<ProviderRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Route a prompt through the provider chain.
    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> RequestOutcome {
        self.generate_with_cancel(prompt, options, &CancellationToken::new())
            .await
    }

    /// Route a prompt, stopping before the next attempt once `cancel` fires.
    ///
    /// An attempt already in flight is allowed to finish; if it succeeds its
    /// response is returned.
    pub async fn generate_with_cancel(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        self.route(Uuid::new_v4(), prompt, options, cancel).await
    }

    #[instrument(skip_all, fields(request_id = %request_id))]
    async fn route(
        &self,
        request_id: Uuid,
        prompt: &str,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let started = Instant::now();
        let chain = self.chain(options.preferred_provider.as_deref());
        let timeout = options.timeout().unwrap_or(self.default_timeout);
        let mut attempts = Vec::with_capacity(chain.len());

        let finish = |attempts: Vec<AttemptRecord>,
                      provider: Option<String>,
                      response: Option<GenerationResponse>,
                      final_error: Option<RouterError>| RequestOutcome {
            request_id,
            success: response.is_some(),
            provider,
            attempts,
            final_error,
            response,
            duration: started.elapsed(),
        };

        if chain.is_empty() {
            tracing::error!("No enabled providers to route to");
            return finish(attempts, None, None, Some(RouterError::NoProviders));
        }

        for (descriptor, provider) in chain {
            if cancel.is_cancelled() {
                tracing::info!(attempts = attempts.len(), "Routing cancelled by caller");
                let error = RouterError::Cancelled {
                    attempts: attempts.clone(),
                };
                return finish(attempts, None, None, Some(error));
            }

            let attempt_started = Instant::now();
            let result = attempt(provider.as_ref(), prompt, options, timeout).await;
            let duration_ms = attempt_started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    attempts.push(AttemptRecord {
                        provider: descriptor.name.clone(),
                        class: AttemptClass::Success,
                        error: None,
                        duration_ms,
                    });
                    self.note_success(&descriptor);
                    tracing::info!(
                        provider = %descriptor.name,
                        attempts = attempts.len(),
                        tokens = response.usage.total(),
                        "Generation succeeded"
                    );
                    return finish(attempts, Some(descriptor.name), Some(response), None);
                }
                Err(error) => {
                    let class = error.classify();
                    tracing::warn!(
                        provider = %descriptor.name,
                        class = %class,
                        retryable = class.is_retryable(),
                        error = %error,
                        "Provider attempt failed"
                    );
                    attempts.push(AttemptRecord {
                        provider: descriptor.name.clone(),
                        class,
                        error: Some(error.to_string()),
                        duration_ms,
                    });
                    self.note_failure(&descriptor, class);
                }
            }
        }

        if cancel.is_cancelled() {
            let error = RouterError::Cancelled {
                attempts: attempts.clone(),
            };
            return finish(attempts, None, None, Some(error));
        }

        tracing::error!(attempts = attempts.len(), "All providers exhausted");
        let error = RouterError::AllProvidersExhausted {
            attempts: attempts.clone(),
        };
        finish(attempts, None, None, Some(error))
    }

    /// Per-call provider order, with the preferred provider moved first.
    fn chain(
        &self,
        preferred: Option<&str>,
    ) -> Vec<(ProviderDescriptor, Arc<dyn GenerationProvider>)> {
        let mut chain = self.registry.snapshot();
        if let Some(name) = preferred {
            match chain.iter().position(|(d, _)| d.name == name) {
                Some(index) => {
                    let entry = chain.remove(index);
                    chain.insert(0, entry);
                }
                None => tracing::debug!(provider = %name, "Preferred provider not available"),
            }
        }
        chain
    }

    fn note_success(&self, descriptor: &ProviderDescriptor) {
        if let Err(e) = self.registry.mark_healthy(&descriptor.name) {
            tracing::debug!(error = %e, "Health update skipped");
        }
    }

    fn note_failure(&self, descriptor: &ProviderDescriptor, class: AttemptClass) {
        let update = match class {
            c if !c.is_provider_fault() => Ok(()),
            AttemptClass::Auth | AttemptClass::Config => self.registry.mark_unhealthy(&descriptor.name),
            _ => self.registry.record_failure(&descriptor.name).map(|_| ()),
        };
        if let Err(e) = update {
            tracing::debug!(error = %e, "Health update skipped");
        }
    }
}

impl std::fmt::Debug for FallbackRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackRouter")
            .field("registry", &self.registry)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

async fn attempt(
    provider: &dyn GenerationProvider,
    prompt: &str,
    options: &GenerationOptions,
    timeout: Duration,
) -> Result<GenerationResponse, ProviderError> {
    match tokio::time::timeout(timeout, provider.generate(prompt, options)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}
