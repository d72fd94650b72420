//! The gateway service.
//!
//! Wires one request through the full flow:
//! - Estimate prompt and completion size, price the estimate
//! - Admit against the tier's circuit breaker and quota ledger
//! - Route through the provider fallback chain
//! - Record actual usage, possibly opening the circuit
//!
//! Alert polling runs as a separate task started and stopped with the
//! service.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use tollgate_core::{
    AdmissionError, AdmissionGate, CircuitBreaker, Clock, ConfigError, Decision, GatewayConfig,
    LedgerError, LedgerStore, QuotaLedger, QuotaScope, SystemClock, UsageSnapshot,
};

use crate::alerts::{AlertDispatcher, AlertHandle, AlertPolicy, AlertTransport, LogTransport};
use crate::pricing::PricingTable;
use crate::providers::{
    estimate_tokens, GenerationOptions, GenerationProvider, ProviderCatalog, TokenUsage,
};
use crate::recorder::UsageRecorder;
use crate::registry::{ProviderDescriptor, ProviderRegistry, RegistryError};
use crate::router::{AttemptRecord, FallbackRouter, RouterError};

/// Errors from the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Request rejected: {}", .0.reason().unwrap_or_default())]
    Rejected(Box<Decision>),

    #[error(transparent)]
    Routing(#[from] RouterError),
}

impl GatewayError {
    /// Admission decision when the request was rejected with a 429.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            GatewayError::Rejected(decision) => Some(decision),
            _ => None,
        }
    }
}

/// A generation request as accepted by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,

    #[serde(default)]
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// A served generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReply {
    pub request_id: Uuid,
    pub text: String,
    pub provider_used: String,
    pub model: String,
    pub usage: TokenUsage,

    /// Billed cost in USD
    pub cost: f64,

    /// Failed attempts before the serving provider
    pub fallback_attempts: Vec<AttemptRecord>,
}

/// Running gateway: admission, routing, recording and alerts for all tiers.
pub struct Gateway {
    gate: AdmissionGate,
    router: FallbackRouter,
    recorder: UsageRecorder,
    dispatcher: Arc<AlertDispatcher>,
    pricing: PricingTable,
    alerts: Mutex<Option<AlertHandle>>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Admission decision for an already-estimated request.
    pub fn admit(
        &self,
        estimated_tokens: u64,
        estimated_cost: f64,
        tier: &str,
    ) -> Result<Decision, AdmissionError> {
        self.gate.admit(estimated_tokens, estimated_cost, tier)
    }

    /// Serve one request for a tier.
    pub async fn generate(
        &self,
        tier: &str,
        request: GenerationRequest,
    ) -> Result<GenerationReply, GatewayError> {
        self.generate_with_cancel(tier, request, &CancellationToken::new())
            .await
    }

    /// Serve one request; once `cancel` fires no further provider is tried.
    #[instrument(skip_all, fields(tier = %tier))]
    pub async fn generate_with_cancel(
        &self,
        tier: &str,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationReply, GatewayError> {
        let scope = self
            .gate
            .scope(tier)
            .cloned()
            .ok_or_else(|| AdmissionError::UnknownTier(tier.to_string()))?;

        let prompt_tokens = self.estimate_prompt(&request);
        let max_tokens = request.options.max_tokens;
        let estimated_tokens = u64::from(prompt_tokens) + u64::from(max_tokens);
        let estimated_cost = self.pricing.estimate(prompt_tokens, max_tokens);

        let decision = self.gate.admit(estimated_tokens, estimated_cost, tier)?;
        if !decision.allowed {
            tracing::info!(
                reason = %decision.reason().unwrap_or_default(),
                retry_after = decision.retry_after_seconds,
                "Request rejected at admission"
            );
            return Err(GatewayError::Rejected(Box::new(decision)));
        }

        let outcome = self
            .router
            .generate_with_cancel(&request.prompt, &request.options, cancel)
            .await;

        let (tokens_used, cost) = match &outcome.response {
            Some(response) => (
                u64::from(response.usage.total()),
                response
                    .cost
                    .unwrap_or_else(|| self.pricing.cost(&response.model, &response.usage)),
            ),
            None => (0, 0.0),
        };
        let duration_ms = outcome.duration.as_millis() as u64;
        self.recorder
            .record(&scope, &outcome, tokens_used, cost, duration_ms)
            .await;

        let request_id = outcome.request_id;
        let provider_used = outcome.provider.clone().unwrap_or_default();
        let fallback_attempts = outcome.fallback_attempts();
        let response = outcome.into_result()?;

        Ok(GenerationReply {
            request_id,
            text: response.text,
            provider_used,
            model: response.model,
            usage: response.usage,
            cost,
            fallback_attempts,
        })
    }

    /// Prompt size as the first provider the router would try counts it.
    fn estimate_prompt(&self, request: &GenerationRequest) -> u32 {
        let chain = self.router.registry().snapshot();
        let preferred = request.options.preferred_provider.as_deref();
        let head = preferred
            .and_then(|name| chain.iter().find(|(d, _)| d.name == name))
            .or_else(|| chain.first());
        match head {
            Some((_, provider)) => provider.estimate_tokens(&request.prompt),
            None => estimate_tokens(&request.prompt),
        }
    }

    /// Current usage for a tier.
    pub fn usage(&self, tier: &str) -> Result<UsageSnapshot, AdmissionError> {
        self.gate
            .scope(tier)
            .map(|scope| scope.ledger.current_usage())
            .ok_or_else(|| AdmissionError::UnknownTier(tier.to_string()))
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.router.registry()
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    /// Start background alert polling. Calling it twice is a no-op.
    pub fn start_alerts(&self) {
        let mut alerts = self.alerts.lock();
        if alerts.is_none() {
            *alerts = Some(self.dispatcher.clone().start());
        }
    }

    /// Stop background work.
    pub async fn shutdown(&self) {
        let handle = self.alerts.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("gate", &self.gate)
            .field("router", &self.router)
            .field("recorder", &self.recorder)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    clock: Option<Arc<dyn Clock>>,
    catalog: Option<ProviderCatalog>,
    providers: Vec<(ProviderDescriptor, Arc<dyn GenerationProvider>)>,
    transports: Vec<Arc<dyn AlertTransport>>,
    pricing: PricingTable,
    ledger_dir: Option<PathBuf>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            clock: None,
            catalog: None,
            providers: Vec::new(),
            transports: Vec::new(),
            pricing: PricingTable::default(),
            ledger_dir: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Time source for windows and cooldowns; the system clock by default.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Factories for configured provider types.
    pub fn catalog(mut self, catalog: ProviderCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Register an already-built provider after the configured ones.
    pub fn provider(
        mut self,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn GenerationProvider>,
    ) -> Self {
        self.providers.push((descriptor, provider));
        self
    }

    /// Add an alert transport.
    pub fn transport(mut self, transport: Arc<dyn AlertTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Persist the ledger here instead of the configured directory.
    pub fn ledger_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ledger_dir = Some(dir.into());
        self
    }

    /// Build the gateway, rebuilding usage windows from the ledger on disk.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self
            .config
            .ok_or_else(|| ConfigError::Invalid("no configuration set".to_string()))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let store = match self.ledger_dir.or_else(|| config.ledger.directory.clone()) {
            Some(dir) => Some(Arc::new(LedgerStore::open(dir)?)),
            None => None,
        };
        let records = match &store {
            Some(store) => {
                let loaded = store.load_current(clock.now())?;
                if let Some(path) = &loaded.quarantined {
                    tracing::warn!(
                        quarantined_to = %path.display(),
                        "Usage windows start from zero after ledger corruption"
                    );
                }
                loaded.records
            }
            None => Vec::new(),
        };

        let mut gate = AdmissionGate::new();
        let mut scopes = Vec::new();
        for (name, tier) in config.resolved_tiers()? {
            let history = records.iter().filter(|r| r.tier() == Some(name.as_str()));
            let ledger = QuotaLedger::from_records(name.clone(), tier, clock.clone(), history);
            let breaker =
                CircuitBreaker::new(name.clone(), config.circuit_breaker.clone(), clock.clone());
            // Rebuilt usage may already be past the critical threshold.
            breaker.evaluate(&ledger.current_usage());
            let scope = Arc::new(QuotaScope::new(Arc::new(ledger), Arc::new(breaker)));
            gate.insert(scope.clone());
            scopes.push(scope);
        }

        let catalog = self.catalog.unwrap_or_else(ProviderCatalog::with_defaults);
        let registry = ProviderRegistry::from_config(
            &config.providers,
            &catalog,
            config.routing.unhealthy_after,
        )?;
        for (descriptor, provider) in self.providers {
            registry.register(descriptor, provider)?;
        }
        let router = FallbackRouter::new(Arc::new(registry), config.routing.default_timeout);

        let mut transports = self.transports;
        for entry in &config.alerts.transports {
            if transports.iter().any(|t| t.kind() == entry.kind) {
                continue;
            }
            if entry.kind == "log" {
                transports.push(Arc::new(LogTransport));
            } else {
                tracing::warn!(
                    kind = %entry.kind,
                    "No alert transport registered for configured kind; alerts of this kind are dropped"
                );
            }
        }
        let dispatcher = Arc::new(AlertDispatcher::new(
            scopes,
            transports,
            AlertPolicy::from(&config.alerts),
        ));

        tracing::info!(
            tiers = gate.scopes().count(),
            providers = router.registry().len(),
            persistent = store.is_some(),
            "Gateway ready"
        );

        Ok(Gateway {
            gate,
            router,
            recorder: UsageRecorder::new(store),
            dispatcher,
            pricing: self.pricing,
            alerts: Mutex::new(None),
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
