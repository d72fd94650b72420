//! Ordered, health-annotated provider list.
//!
//! Health is advisory: an unhealthy provider is moved to the back of the
//! order, never dropped from it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tollgate_core::ProviderEntry;

use crate::providers::{GenerationProvider, ProviderCatalog, ProviderError};

/// Errors from the provider registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Provider '{0}' is already registered")]
    DuplicateName(String),

    #[error("Unknown provider: '{0}'")]
    UnknownProvider(String),

    #[error("Failed to build provider '{name}': {source}")]
    Build {
        name: String,
        #[source]
        source: ProviderError,
    },
}

/// Configured provider with its runtime flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub priority: u32,
    pub endpoint_config: serde_json::Value,
    pub enabled: bool,
    pub last_known_healthy: bool,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            endpoint_config: serde_json::Value::Null,
            enabled: true,
            last_known_healthy: true,
        }
    }
}

struct Slot {
    descriptor: ProviderDescriptor,
    provider: Arc<dyn GenerationProvider>,
    consecutive_failures: u32,
}

/// Registered providers in registration order.
pub struct ProviderRegistry {
    slots: RwLock<Vec<Slot>>,
    unhealthy_after: u32,
}

impl ProviderRegistry {
    /// Empty registry; `unhealthy_after` consecutive failures mark a
    /// provider unhealthy.
    pub fn new(unhealthy_after: u32) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            unhealthy_after: unhealthy_after.max(1),
        }
    }

    /// Build every configured provider through the catalog.
    ///
    /// Disabled entries are still built so they can be enabled at runtime.
    pub fn from_config(
        entries: &[ProviderEntry],
        catalog: &ProviderCatalog,
        unhealthy_after: u32,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new(unhealthy_after);
        for entry in entries {
            let provider = catalog
                .create(&entry.provider_type, &entry.config)
                .map_err(|source| RegistryError::Build {
                    name: entry.name.clone(),
                    source,
                })?;
            let descriptor = ProviderDescriptor {
                name: entry.name.clone(),
                priority: entry.priority,
                endpoint_config: entry.config.clone(),
                enabled: entry.enabled,
                last_known_healthy: true,
            };
            registry.register(descriptor, provider)?;
            tracing::info!(
                provider = %entry.name,
                kind = %entry.provider_type,
                priority = entry.priority,
                enabled = entry.enabled,
                "Provider registered"
            );
        }
        Ok(registry)
    }

    /// Add a provider after any already registered.
    pub fn register(
        &self,
        descriptor: ProviderDescriptor,
        provider: Arc<dyn GenerationProvider>,
    ) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        if slots.iter().any(|s| s.descriptor.name == descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        slots.push(Slot {
            descriptor,
            provider,
            consecutive_failures: 0,
        });
        Ok(())
    }

    /// Enabled descriptors: healthy before unhealthy, then ascending
    /// priority, then registration order.
    pub fn list(&self) -> Vec<ProviderDescriptor> {
        self.snapshot().into_iter().map(|(d, _)| d).collect()
    }

    /// Ordered providers for one routing call.
    pub fn snapshot(&self) -> Vec<(ProviderDescriptor, Arc<dyn GenerationProvider>)> {
        let slots = self.slots.read();
        let mut ordered: Vec<(usize, &Slot)> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.descriptor.enabled)
            .collect();
        ordered.sort_by_key(|(index, s)| {
            (!s.descriptor.last_known_healthy, s.descriptor.priority, *index)
        });
        ordered
            .into_iter()
            .map(|(_, s)| (s.descriptor.clone(), s.provider.clone()))
            .collect()
    }

    /// Descriptor by name, enabled or not.
    pub fn get(&self, name: &str) -> Option<ProviderDescriptor> {
        self.slots
            .read()
            .iter()
            .find(|s| s.descriptor.name == name)
            .map(|s| s.descriptor.clone())
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn mark_unhealthy(&self, name: &str) -> Result<(), RegistryError> {
        self.with_slot(name, |slot| {
            if slot.descriptor.last_known_healthy {
                tracing::warn!(provider = %name, "Provider marked unhealthy");
            }
            slot.descriptor.last_known_healthy = false;
        })
    }

    pub fn mark_healthy(&self, name: &str) -> Result<(), RegistryError> {
        self.with_slot(name, |slot| {
            if !slot.descriptor.last_known_healthy {
                tracing::info!(provider = %name, "Provider healthy again");
            }
            slot.descriptor.last_known_healthy = true;
            slot.consecutive_failures = 0;
        })
    }

    /// Toggle a provider in or out of rotation.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        self.with_slot(name, |slot| slot.descriptor.enabled = enabled)
    }

    /// Count a provider-side failure.
    ///
    /// Returns true when this failure made the provider unhealthy.
    pub fn record_failure(&self, name: &str) -> Result<bool, RegistryError> {
        let threshold = self.unhealthy_after;
        let mut tripped = false;
        self.with_slot(name, |slot| {
            slot.consecutive_failures = slot.consecutive_failures.saturating_add(1);
            if slot.descriptor.last_known_healthy && slot.consecutive_failures >= threshold {
                slot.descriptor.last_known_healthy = false;
                tripped = true;
            }
        })?;
        if tripped {
            tracing::warn!(provider = %name, failures = threshold, "Provider marked unhealthy");
        }
        Ok(tripped)
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self, name: &str) -> Option<u32> {
        self.slots
            .read()
            .iter()
            .find(|s| s.descriptor.name == name)
            .map(|s| s.consecutive_failures)
    }

    fn with_slot(&self, name: &str, f: impl FnOnce(&mut Slot)) -> Result<(), RegistryError> {
        let mut slots = self.slots.write();
        let slot = slots
            .iter_mut()
            .find(|s| s.descriptor.name == name)
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))?;
        f(slot);
        Ok(())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .slots
            .read()
            .iter()
            .map(|s| s.descriptor.name.clone())
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .field("unhealthy_after", &self.unhealthy_after)
            .finish()
    }
}
