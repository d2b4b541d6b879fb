use std::collections::HashMap;
use std::sync::Arc;

use machina_domain::Machine;
use machina_provider::FinalizerHook;
use machina_store::MachineStore;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Owns the provider-supplied deletion hooks and runs them once the backend
/// resource is gone.
#[derive(Default)]
pub struct FinalizerManager {
    hooks: HashMap<String, Arc<dyn FinalizerHook>>,
}

impl FinalizerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn FinalizerHook>) -> &mut Self {
        self.hooks.insert(hook.name().to_string(), hook);
        self
    }

    /// Run every finalizer on `machine` in declaration order, repairing the
    /// two inconsistency shapes first:
    /// - annotation without its finalizer: stale record, drop the annotation;
    /// - finalizer without its annotation: nothing to release, drop the
    ///   finalizer.
    /// Hooks themselves remove their annotation and then their finalizer, so
    /// a machine that survives this call with an empty finalizer set is fully
    /// released.
    pub async fn run_all(
        &self,
        machine: &Machine,
        store: &Arc<dyn MachineStore>,
    ) -> Result<(), EngineError> {
        for name in self.hooks.keys() {
            if machine.annotations.contains_key(name) && !machine.finalizers.has(name) {
                warn!(machine = %machine.key(), finalizer = %name,
                      "annotation without finalizer, repairing");
                let key = name.clone();
                store
                    .update(&machine.namespace, &machine.name, &move |m| {
                        m.remove_annotation(&key);
                    })
                    .await?;
            }
        }

        for name in machine.finalizers.list().to_vec() {
            let Some(hook) = self.hooks.get(&name) else {
                warn!(machine = %machine.key(), finalizer = %name,
                      "no handler registered, dropping finalizer");
                let key = name.clone();
                store
                    .update(&machine.namespace, &machine.name, &move |m| {
                        m.finalizers.remove(&key);
                    })
                    .await?;
                continue;
            };

            if machine.annotation(&name).is_none() {
                warn!(machine = %machine.key(), finalizer = %name,
                      "finalizer without annotation, nothing to release");
                let key = name.clone();
                store
                    .update(&machine.namespace, &machine.name, &move |m| {
                        m.finalizers.remove(&key);
                    })
                    .await?;
                continue;
            }

            debug!(machine = %machine.key(), finalizer = %name, "running finalizer");
            hook.run(machine, store).await?;
        }

        Ok(())
    }
}
