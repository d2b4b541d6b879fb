use std::collections::HashMap;
use std::sync::Arc;

use machina_domain::{Machine, ProviderKind};

use crate::error::ProviderError;
use crate::provider::CloudProvider;

/// Dispatches engine calls to the correct backend [`CloudProvider`].
///
/// The provider set is closed: a machine whose spec names an unregistered
/// kind is misconfigured, not a routing problem.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn CloudProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for a backend kind. Returns `&mut self` for chaining.
    pub fn register(&mut self, kind: ProviderKind, provider: Arc<dyn CloudProvider>) -> &mut Self {
        self.providers.insert(kind, provider);
        self
    }

    /// Resolve the provider for the given machine's spec.
    pub fn for_machine(&self, machine: &Machine) -> Result<Arc<dyn CloudProvider>, ProviderError> {
        self.for_kind(machine.spec.provider)
    }

    pub fn for_kind(&self, kind: ProviderKind) -> Result<Arc<dyn CloudProvider>, ProviderError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(ProviderError::NotRegistered(kind))
    }

    /// All backend kinds that have a registered provider.
    pub fn active_kinds(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}
