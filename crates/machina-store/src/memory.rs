use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use machina_domain::Machine;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{MachineStore, Selector};

#[derive(Debug, Default)]
struct Inner {
    machines: HashMap<String, Machine>,
}

/// In-memory implementation of [`MachineStore`].
///
/// All data is lost on process exit. Suitable for tests and the one-shot
/// CLI, which seeds it from a manifest and discards it afterwards.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    /// When non-zero, the next `update` commits see a simulated concurrent
    /// writer and must re-run their mutator. Test instrumentation.
    injected_conflicts: Arc<AtomicU32>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` update commits conflict once each, forcing the
    /// mutator to re-run against a bumped revision.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl MachineStore for InMemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Machine, StoreError> {
        let guard = self.inner.read().await;
        guard
            .machines
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<Machine>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .machines
            .values()
            .filter(|m| selector.matches(m))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        namespace: &str,
        name: &str,
        mutator: &(dyn for<'a> Fn(&'a mut Machine) + Send + Sync),
    ) -> Result<Machine, StoreError> {
        loop {
            let snapshot = self.get(namespace, name).await?;
            let mut mutated = snapshot.clone();
            mutator(&mut mutated);

            let mut guard = self.inner.write().await;
            let stored = guard
                .machines
                .get_mut(&key(namespace, name))
                .ok_or_else(|| StoreError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })?;

            if stored.resource_version != snapshot.resource_version {
                // Another writer committed between our read and write.
                continue;
            }

            if self
                .injected_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                // Simulate that concurrent writer for tests.
                stored.resource_version += 1;
                continue;
            }

            mutated.resource_version = stored.resource_version + 1;
            *stored = mutated.clone();
            return Ok(mutated);
        }
    }

    async fn insert(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let mut guard = self.inner.write().await;
        let k = key(&machine.namespace, &machine.name);
        if guard.machines.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                namespace: machine.namespace.clone(),
                name: machine.name.clone(),
            });
        }
        let mut stored = machine.clone();
        stored.resource_version = 1;
        guard.machines.insert(k, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.machines.remove(&key(namespace, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_domain::*;
    use serde_json::json;

    fn dummy_machine(name: &str) -> Machine {
        Machine {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: Uid::new(format!("uid-{name}")),
            spec: MachineSpec {
                provider: ProviderKind::Fake,
                provider_spec: json!({}),
                operating_system: OperatingSystem::Ubuntu,
                versions: MachineVersions::default(),
            },
            annotations: Default::default(),
            finalizers: Default::default(),
            deletion_timestamp: None,
            status: MachineStatus::default(),
            resource_version: 0,
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryStore::new();
        store.insert(&dummy_machine("w0")).await.unwrap();

        let got = store.get("default", "w0").await.unwrap();
        assert_eq!(got.name, "w0");
        assert_eq!(got.resource_version, 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get("default", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn double_insert_is_rejected() {
        let store = InMemoryStore::new();
        store.insert(&dummy_machine("w0")).await.unwrap();
        assert!(matches!(
            store.insert(&dummy_machine("w0")).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn update_bumps_revision() {
        let store = InMemoryStore::new();
        store.insert(&dummy_machine("w0")).await.unwrap();

        let updated = store
            .update("default", "w0", &|m| {
                m.status.phase = MachinePhase::Provisioning;
            })
            .await
            .unwrap();
        assert_eq!(updated.status.phase, MachinePhase::Provisioning);
        assert_eq!(updated.resource_version, 2);
    }

    #[tokio::test]
    async fn update_reruns_mutator_on_conflict() {
        let store = InMemoryStore::new();
        store.insert(&dummy_machine("w0")).await.unwrap();
        store.inject_conflicts(2);

        let runs = Arc::new(AtomicU32::new(0));
        let runs_in_mutator = runs.clone();
        let updated = store
            .update("default", "w0", &move |m| {
                runs_in_mutator.fetch_add(1, Ordering::SeqCst);
                m.set_annotation("touched", "yes");
            })
            .await
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3, "mutator re-runs per conflict");
        assert_eq!(updated.annotation("touched"), Some("yes"));
        // 2 injected bumps + the real commit
        assert_eq!(updated.resource_version, 4);
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let store = InMemoryStore::new();
        store.insert(&dummy_machine("a")).await.unwrap();
        let mut other = dummy_machine("b");
        other.namespace = "prod".into();
        store.insert(&other).await.unwrap();

        let all = store.list(&Selector::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let prod = store.list(&Selector::namespace("prod")).await.unwrap();
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].name, "b");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        store.insert(&dummy_machine("w0")).await.unwrap();
        store.delete("default", "w0").await.unwrap();
        store.delete("default", "w0").await.unwrap();
        assert!(store.get("default", "w0").await.unwrap_err().is_not_found());
    }
}
