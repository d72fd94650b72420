//! # tollgate-runtime
//!
//! The async half of tollgate: everything that talks to an upstream model
//! provider or runs in the background.
//!
//! - [`FallbackRouter`] walks an ordered, health-annotated provider list,
//!   one attempt per provider, each under a timeout
//! - [`UsageRecorder`] writes actual usage back into the ledger exactly once
//!   per request and lets the circuit breaker react
//! - [`AlertDispatcher`] polls usage and raises threshold and circuit alerts
//! - [`Gateway`] wires admission, routing and recording for every tier
//!
//! Admission itself is synchronous and lives in `tollgate-core`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tollgate_core::GatewayConfig;
//! use tollgate_runtime::{Gateway, GenerationRequest};
//!
//! let config = GatewayConfig::from_file("gateway.yaml")?;
//! let gateway = Gateway::builder().config(config).build()?;
//! gateway.start_alerts();
//!
//! let reply = gateway.generate("free", GenerationRequest::new("Summarize this")).await?;
//! println!("{} (via {})", reply.text, reply.provider_used);
//!
//! gateway.shutdown().await;
//! ```

pub mod alerts;
pub mod gateway;
pub mod pricing;
pub mod providers;
pub mod recorder;
pub mod registry;
pub mod router;

pub use alerts::{
    Alert, AlertDispatcher, AlertHandle, AlertLevel, AlertPolicy, AlertTransport, LogTransport,
    TransportError,
};
pub use gateway::{Gateway, GatewayBuilder, GatewayError, GenerationReply, GenerationRequest};
pub use pricing::{ModelRates, PricingTable};
pub use providers::{
    estimate_tokens, ApiCredential, AttemptClass, GenerationOptions, GenerationProvider,
    GenerationResponse, ProviderCatalog, ProviderError, ProviderFactory, TokenUsage,
};
pub use recorder::{Recorded, UsageRecorder};
pub use registry::{ProviderDescriptor, ProviderRegistry, RegistryError};
pub use router::{AttemptRecord, FallbackRouter, RequestOutcome, RouterError};
