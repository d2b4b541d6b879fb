use async_trait::async_trait;
use machina_domain::{Machine, ProviderKind};

use crate::error::StoreError;

/// Narrow filter for `list`. Empty selector matches everything.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub namespace: Option<String>,
    pub provider: Option<ProviderKind>,
}

impl Selector {
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, machine: &Machine) -> bool {
        if let Some(ns) = &self.namespace {
            if &machine.namespace != ns {
                return false;
            }
        }
        if let Some(p) = self.provider {
            if machine.spec.provider != p {
                return false;
            }
        }
        true
    }
}

/// The persistence boundary. The store owns Machine objects; the controller
/// reads them and writes status/annotations/finalizers through `update`.
#[async_trait]
pub trait MachineStore: Send + Sync + 'static {
    /// Returns `StoreError::NotFound` when absent.
    async fn get(&self, namespace: &str, name: &str) -> Result<Machine, StoreError>;

    async fn list(&self, selector: &Selector) -> Result<Vec<Machine>, StoreError>;

    /// Read-modify-write with optimistic concurrency. The mutator is applied
    /// to the latest revision and MAY BE RE-RUN if another writer got in
    /// between, so it must be side-effect free apart from mutating the
    /// machine. Returns the stored machine after a successful commit.
    async fn update(
        &self,
        namespace: &str,
        name: &str,
        mutator: &(dyn for<'a> Fn(&'a mut Machine) + Send + Sync),
    ) -> Result<Machine, StoreError>;

    /// Insert a new machine. Fails with `AlreadyExists` on key collision.
    async fn insert(&self, machine: &Machine) -> Result<Machine, StoreError>;

    /// Remove a machine. Called by the surrounding loop once delete reports
    /// done and the finalizer set is empty. Removing an absent machine is
    /// not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
