use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use machina_domain::{
    AddressRole, ErrorReason, Instance, InstanceStatus, Machine, RawSpec, Uid,
};
use serde_json::json;
use tracing::debug;

use crate::error::ProviderError;
use crate::provider::{base_labels, CloudConfig, CloudProvider, ProviderData};

/// A backend that simulates instances in process memory.
///
/// Used by engine and CLI tests. Behavior is steered through the provider
/// spec itself so no out-of-band wiring is needed:
/// - `failValidation`: `"terminal"` | `"unauthorized"` | `"transient"`
/// - `readyAfterGets`: instance reports Creating until observed N times
/// - `asyncDelete`: first cleanup returns in-progress instead of done
///
/// Identity tactic: instances are keyed by machine UID, mirroring the
/// metadata-tag tactic of real backends.
#[derive(Debug, Default)]
pub struct FakeProvider {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    instances: HashMap<String, FakeInstance>,
    create_calls: u32,
    validate_calls: u32,
}

#[derive(Debug, Clone)]
struct FakeInstance {
    id: String,
    name: String,
    ready_after: u32,
    gets_seen: u32,
    deleting: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live instances; test observability.
    pub fn instance_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).instances.len()
    }

    /// Total create calls that actually allocated; test observability.
    pub fn create_calls(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).create_calls
    }

    /// Total validate invocations; test observability for the cache.
    pub fn validate_calls(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).validate_calls
    }

    fn to_instance(fake: &FakeInstance) -> Instance {
        let status = if fake.deleting {
            InstanceStatus::Deleting
        } else if fake.gets_seen < fake.ready_after {
            InstanceStatus::Creating
        } else {
            InstanceStatus::Running
        };

        let mut addresses = HashMap::new();
        if status == InstanceStatus::Running {
            addresses.insert("192.0.2.1".to_string(), AddressRole::InternalIp);
            addresses.insert(
                format!("{}.fake.local", fake.name),
                AddressRole::Hostname,
            );
        }

        Instance {
            id: fake.id.clone(),
            name: fake.name.clone(),
            status,
            addresses,
            provider_uri: format!("fake:///{}", fake.id),
        }
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn validate(&self, spec: &RawSpec) -> Result<(), ProviderError> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).validate_calls += 1;
        match spec["failValidation"].as_str() {
            Some("terminal") => Err(ProviderError::invalid_config("validation refused by spec")),
            Some("unauthorized") => Err(ProviderError::terminal(
                ErrorReason::Unauthorized,
                "credentials rejected by spec",
            )),
            Some("transient") => Err(ProviderError::Upstream("simulated upstream flake".into())),
            _ => Ok(()),
        }
    }

    fn add_defaults(&self, mut spec: RawSpec) -> Result<RawSpec, ProviderError> {
        if let Some(obj) = spec.as_object_mut() {
            obj.entry("size").or_insert(json!("small"));
        }
        Ok(spec)
    }

    async fn get(&self, machine: &Machine) -> Result<Instance, ProviderError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let fake = inner
            .instances
            .get_mut(machine.uid.as_str())
            .ok_or(ProviderError::InstanceNotFound)?;
        let instance = Self::to_instance(fake);
        if fake.gets_seen < fake.ready_after {
            fake.gets_seen += 1;
        }
        Ok(instance)
    }

    async fn create(
        &self,
        machine: &Machine,
        _userdata: &str,
        _data: &ProviderData,
    ) -> Result<Instance, ProviderError> {
        let ready_after = machine.spec.provider_spec["readyAfterGets"]
            .as_u64()
            .unwrap_or(0) as u32;

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.instances.get(machine.uid.as_str()) {
            // Restart between create and status persistence: adopt.
            debug!(machine = %machine.name, "fake create found existing instance");
            return Ok(Self::to_instance(existing));
        }

        let fake = FakeInstance {
            id: format!("fake-{}", machine.uid),
            name: machine.name.clone(),
            ready_after,
            gets_seen: 0,
            deleting: false,
        };
        let instance = Self::to_instance(&fake);
        inner.instances.insert(machine.uid.as_str().to_string(), fake);
        inner.create_calls += 1;
        Ok(instance)
    }

    async fn cleanup(
        &self,
        machine: &Machine,
        _data: &ProviderData,
    ) -> Result<bool, ProviderError> {
        let async_delete = machine.spec.provider_spec["asyncDelete"]
            .as_bool()
            .unwrap_or(false);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.instances.get_mut(machine.uid.as_str()) {
            None => Ok(true),
            Some(fake) if async_delete && !fake.deleting => {
                fake.deleting = true;
                Ok(false)
            }
            Some(_) => {
                inner.instances.remove(machine.uid.as_str());
                Ok(true)
            }
        }
    }

    async fn migrate_uid(&self, machine: &Machine, new_uid: &Uid) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(fake) = inner.instances.remove(machine.uid.as_str()) {
            inner.instances.insert(new_uid.as_str().to_string(), fake);
        }
        Ok(())
    }

    async fn cloud_config(&self, _spec: &RawSpec) -> Result<CloudConfig, ProviderError> {
        Ok(CloudConfig {
            config: String::new(),
            name: "fake".to_string(),
        })
    }

    fn metrics_labels(&self, machine: &Machine) -> HashMap<String, String> {
        base_labels(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_domain::{MachineSpec, MachineStatus, MachineVersions, OperatingSystem, ProviderKind};
    use machina_store::InMemoryStore;
    use std::sync::Arc;

    fn dummy_machine(uid: &str, spec: RawSpec) -> Machine {
        Machine {
            name: "test".to_string(),
            namespace: "default".to_string(),
            uid: Uid::new(uid),
            spec: MachineSpec {
                provider: ProviderKind::Fake,
                provider_spec: spec,
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

    fn data() -> ProviderData {
        ProviderData {
            store: Arc::new(InMemoryStore::new()),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_uid() {
        let provider = FakeProvider::new();
        let m = dummy_machine("u1", json!({}));

        let first = provider.create(&m, "userdata", &data()).await.unwrap();
        let second = provider.create(&m, "userdata", &data()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(provider.instance_count(), 1);
        assert_eq!(provider.create_calls(), 1);
    }

    #[tokio::test]
    async fn get_finds_instance_without_status_help() {
        let provider = FakeProvider::new();
        let m = dummy_machine("u1", json!({}));
        provider.create(&m, "", &data()).await.unwrap();

        let inst = provider.get(&m).await.unwrap();
        assert_eq!(inst.id, "fake-u1");
        assert_eq!(inst.status, InstanceStatus::Running);
        assert!(inst.address_of(AddressRole::InternalIp).is_some());
    }

    #[tokio::test]
    async fn get_unknown_machine_is_not_found() {
        let provider = FakeProvider::new();
        let m = dummy_machine("nope", json!({}));
        assert!(matches!(
            provider.get(&m).await,
            Err(ProviderError::InstanceNotFound)
        ));
    }

    #[tokio::test]
    async fn ready_after_gets_delays_running() {
        let provider = FakeProvider::new();
        let m = dummy_machine("u1", json!({ "readyAfterGets": 2 }));
        provider.create(&m, "", &data()).await.unwrap();

        assert_eq!(provider.get(&m).await.unwrap().status, InstanceStatus::Creating);
        assert_eq!(provider.get(&m).await.unwrap().status, InstanceStatus::Creating);
        assert_eq!(provider.get(&m).await.unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let provider = FakeProvider::new();
        let m = dummy_machine("u1", json!({}));
        provider.create(&m, "", &data()).await.unwrap();

        assert!(provider.cleanup(&m, &data()).await.unwrap());
        assert!(provider.cleanup(&m, &data()).await.unwrap());
        assert_eq!(provider.instance_count(), 0);
    }

    #[tokio::test]
    async fn async_delete_reports_in_progress_once() {
        let provider = FakeProvider::new();
        let m = dummy_machine("u1", json!({ "asyncDelete": true }));
        provider.create(&m, "", &data()).await.unwrap();

        assert!(!provider.cleanup(&m, &data()).await.unwrap());
        assert!(provider.cleanup(&m, &data()).await.unwrap());
    }

    #[tokio::test]
    async fn migrate_uid_rekeys_instance() {
        let provider = FakeProvider::new();
        let m = dummy_machine("old", json!({}));
        provider.create(&m, "", &data()).await.unwrap();

        provider.migrate_uid(&m, &Uid::new("new")).await.unwrap();

        assert!(matches!(
            provider.get(&m).await,
            Err(ProviderError::InstanceNotFound)
        ));
        let migrated = dummy_machine("new", json!({}));
        assert!(provider.get(&migrated).await.is_ok());
    }

    #[test]
    fn add_defaults_is_a_fixed_point() {
        let provider = FakeProvider::new();
        let once = provider.add_defaults(json!({})).unwrap();
        let twice = provider.add_defaults(once.clone()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once["size"], "small");
    }

    #[tokio::test]
    async fn validation_knobs_classify_errors() {
        let provider = FakeProvider::new();
        let terminal = provider
            .validate(&json!({ "failValidation": "terminal" }))
            .await
            .unwrap_err();
        assert!(terminal.is_terminal());

        let transient = provider
            .validate(&json!({ "failValidation": "transient" }))
            .await
            .unwrap_err();
        assert!(!transient.is_terminal());
    }
}
