use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use machina_domain::{Instance, Machine, RawSpec, Uid};
use machina_store::MachineStore;

use crate::error::ProviderError;

/// Ambient handles a provider may need mid-operation. Today that is the
/// store, used to persist finalizer/annotation pairs for out-of-band
/// allocations (e.g. a floating IP) before any await point the engine might
/// abandon.
#[derive(Clone)]
pub struct ProviderData {
    pub store: Arc<dyn MachineStore>,
}

/// Downstream cloud-provider configuration blob consumed by the OS layer.
/// Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub config: String,
    /// Cloud-provider name the kubelet is started with (e.g. "openstack").
    pub name: String,
}

/// The uniform backend contract. One implementation per [`machina_domain::ProviderKind`];
/// the engine never sees anything more specific than this trait.
///
/// Cancellation is cooperative: every async method is a future the engine may
/// drop at a suspension point. Methods that allocate externally must persist
/// the external ID (finalizer + annotation, via [`ProviderData`]) before the
/// first await that could be abandoned.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    // ── Spec handling ─────────────────────────────────────────────────────────

    /// Pure check of the provider spec; may call upstream read-only.
    /// Terminal for unrecoverable config problems, plain errors for transient
    /// upstream failures.
    async fn validate(&self, spec: &RawSpec) -> Result<(), ProviderError>;

    /// Deterministic defaulter. Must be a fixed point:
    /// `add_defaults(add_defaults(x)) == add_defaults(x)`.
    fn add_defaults(&self, spec: RawSpec) -> Result<RawSpec, ProviderError>;

    // ── Instance lifecycle ────────────────────────────────────────────────────

    /// Find the backend resource bound to this machine using only
    /// (provider-spec, name, uid) — never Status. Returns
    /// [`ProviderError::InstanceNotFound`] when absent; never a partial
    /// instance on success. Safe to call in any state.
    async fn get(&self, machine: &Machine) -> Result<Instance, ProviderError>;

    /// Allocate the backend resource and attach userdata. Idempotent with
    /// respect to machine identity: when the resource already exists (e.g.
    /// restart between create and status persistence), returns it as
    /// success. The engine guarantees no concurrent create for the same
    /// machine.
    async fn create(
        &self,
        machine: &Machine,
        userdata: &str,
        data: &ProviderData,
    ) -> Result<Instance, ProviderError>;

    /// Tear down the backend resource. Idempotent and safe in any state;
    /// returns `Ok(false)` while asynchronous deletion is still in progress
    /// and `Ok(true)` once the resource is fully gone (including when it
    /// never existed).
    async fn cleanup(&self, machine: &Machine, data: &ProviderData)
        -> Result<bool, ProviderError>;

    // ── Identity ──────────────────────────────────────────────────────────────

    /// Rewrite identity tags on the backend resource after an
    /// externally-initiated UID change. `machine.uid` still carries the old
    /// UID. A no-op for backends whose naming doesn't depend on the UID.
    async fn migrate_uid(&self, machine: &Machine, new_uid: &Uid) -> Result<(), ProviderError>;

    // ── Ancillary ─────────────────────────────────────────────────────────────

    /// Produce the cloud-provider config blob for the OS layer.
    async fn cloud_config(&self, spec: &RawSpec) -> Result<CloudConfig, ProviderError>;

    /// Labels for telemetry.
    fn metrics_labels(&self, machine: &Machine) -> HashMap<String, String>;
}

impl std::fmt::Debug for dyn CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn CloudProvider")
            .field("name", &self.name())
            .finish()
    }
}

/// A named deletion hook for resources allocated outside the primary
/// instance. Providers register these with the engine; the engine runs them
/// in the machine's declaration order once `cleanup` reports done. Hooks are
/// idempotent and remove their annotation, then their finalizer entry.
#[async_trait]
pub trait FinalizerHook: Send + Sync + 'static {
    /// The finalizer name; also the annotation key carrying the external ID.
    fn name(&self) -> &'static str;

    async fn run(&self, machine: &Machine, store: &Arc<dyn MachineStore>)
        -> Result<(), ProviderError>;
}

/// Default labels shared by every provider's `metrics_labels`.
pub(crate) fn base_labels(machine: &Machine) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("machine".to_string(), machine.name.clone());
    labels.insert("namespace".to_string(), machine.namespace.clone());
    labels.insert(
        "provider".to_string(),
        machine.spec.provider.to_string(),
    );
    labels.insert(
        "operating_system".to_string(),
        machine.spec.operating_system.to_string(),
    );
    labels
}
