use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use machina_config::{DeclaredValue, Resolver};
use machina_domain::{
    spec_fingerprint, AddressRole, Instance, InstanceStatus, Machine, RawSpec, Uid,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{classify_http, ProviderError};
use crate::provider::{base_labels, CloudConfig, CloudProvider, ProviderData};

/// Label carrying the machine UID on every VMI, for observability only —
/// identity is the stable name, never the label.
const LABEL_UID: &str = "machina.dev/machine-uid";
const LABEL_MACHINE: &str = "machina.dev/machine";

// ── Raw spec ──────────────────────────────────────────────────────────────────

/// The provider-spec shape for `provider: kubevirt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubevirtSpec {
    #[serde(default = "default_api_url")]
    pub api_url: DeclaredValue,
    #[serde(default = "default_api_token")]
    pub api_token: DeclaredValue,
    #[serde(default = "default_namespace")]
    pub namespace: DeclaredValue,
    pub cpus: DeclaredValue,
    pub memory: DeclaredValue,
    /// HTTP source of the boot disk image.
    pub source_url: DeclaredValue,
}

fn default_api_url() -> DeclaredValue {
    DeclaredValue::env("KUBEVIRT_API_URL")
}
fn default_api_token() -> DeclaredValue {
    DeclaredValue::env("KUBEVIRT_API_TOKEN")
}
fn default_namespace() -> DeclaredValue {
    DeclaredValue::literal("default")
}

struct ResolvedSpec {
    api_url: String,
    api_token: String,
    namespace: String,
    cpus: String,
    memory: String,
    source_url: String,
}

// ── Stable naming ─────────────────────────────────────────────────────────────

/// Deterministic VMI name for a provider spec.
///
/// The node name must survive VMI recreation, so it is derived from the spec
/// alone: `machine-` plus the first 40 hex chars of the SHA-256 over the
/// canonical (key-sorted) JSON serialization. Hex keeps the name a valid DNS
/// label; 48 chars total stays under the 63-char limit while retaining 160
/// bits of the digest.
pub fn stable_vm_name(spec: &RawSpec) -> String {
    format!("machine-{}", &spec_fingerprint(spec)[..40])
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct KubevirtProvider {
    resolver: Resolver,
    client: reqwest::Client,
}

impl KubevirtProvider {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            client: reqwest::Client::new(),
        }
    }

    fn parse_spec(raw: &RawSpec) -> Result<KubevirtSpec, ProviderError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::invalid_config(format!("kubevirt spec: {}", e)))
    }

    async fn resolve_spec(&self, raw: &RawSpec) -> Result<ResolvedSpec, ProviderError> {
        let spec = Self::parse_spec(raw)?;
        let r = &self.resolver;
        let invalid = |e: machina_config::ConfigError| ProviderError::invalid_config(e.to_string());

        Ok(ResolvedSpec {
            api_url: r.resolve(&spec.api_url).await.map_err(invalid)?,
            api_token: r.resolve(&spec.api_token).await.map_err(invalid)?,
            namespace: r.resolve(&spec.namespace).await.map_err(invalid)?,
            cpus: r.resolve(&spec.cpus).await.map_err(invalid)?,
            memory: r.resolve(&spec.memory).await.map_err(invalid)?,
            source_url: r.resolve(&spec.source_url).await.map_err(invalid)?,
        })
    }

    fn vmi_url(resolved: &ResolvedSpec, name: &str) -> String {
        format!(
            "{}/apis/kubevirt.io/v1/namespaces/{}/virtualmachineinstances/{}",
            resolved.api_url.trim_end_matches('/'),
            resolved.namespace,
            name,
        )
    }

    fn vmi_collection_url(resolved: &ResolvedSpec) -> String {
        format!(
            "{}/apis/kubevirt.io/v1/namespaces/{}/virtualmachineinstances",
            resolved.api_url.trim_end_matches('/'),
            resolved.namespace,
        )
    }

    async fn api_get(
        &self,
        resolved: &ResolvedSpec,
        url: &str,
    ) -> Result<(u16, Value), ProviderError> {
        debug!(url, "kubevirt GET");
        let resp = self
            .client
            .get(url)
            .bearer_auth(&resolved.api_token)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if status == 404 {
            return Ok((status, Value::Null));
        }
        if !(200..300).contains(&status) {
            return Err(classify_http(status, &text));
        }
        let body = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Upstream(format!("decode: {}", e)))?;
        Ok((status, body))
    }

    fn vmi_to_instance(resolved: &ResolvedSpec, name: &str, vmi: &Value) -> Instance {
        let status = if vmi["metadata"]["deletionTimestamp"].is_string() {
            InstanceStatus::Deleting
        } else {
            match vmi["status"]["phase"].as_str().unwrap_or("") {
                "Running" => InstanceStatus::Running,
                "Pending" | "Scheduling" | "Scheduled" => InstanceStatus::Creating,
                _ => InstanceStatus::Unknown,
            }
        };

        let mut addresses = HashMap::new();
        for iface in vmi["status"]["interfaces"].as_array().into_iter().flatten() {
            if let Some(ip) = iface["ipAddress"].as_str() {
                addresses.insert(ip.to_string(), AddressRole::InternalIp);
            }
        }
        if status == InstanceStatus::Running {
            addresses.insert(name.to_string(), AddressRole::InternalDns);
        }

        let id = vmi["metadata"]["uid"]
            .as_str()
            .unwrap_or(name)
            .to_string();

        Instance {
            id,
            name: name.to_string(),
            status,
            addresses,
            provider_uri: format!("kubevirt://{}/{}", resolved.namespace, name),
        }
    }

    fn vmi_manifest(
        resolved: &ResolvedSpec,
        machine: &Machine,
        name: &str,
        userdata: &str,
    ) -> Value {
        json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachineInstance",
            "metadata": {
                "name": name,
                "namespace": resolved.namespace,
                "labels": {
                    LABEL_MACHINE: machine.name,
                    LABEL_UID: machine.uid.as_str(),
                },
            },
            "spec": {
                "domain": {
                    "cpu": { "cores": resolved.cpus.parse::<u64>().unwrap_or(1) },
                    "resources": {
                        "requests": { "memory": resolved.memory }
                    },
                    "devices": {
                        "disks": [
                            { "name": "boot", "disk": { "bus": "virtio" } },
                            { "name": "cloudinit", "disk": { "bus": "virtio" } },
                        ]
                    },
                },
                "volumes": [
                    {
                        "name": "boot",
                        "containerDisk": { "image": resolved.source_url }
                    },
                    {
                        "name": "cloudinit",
                        "cloudInitNoCloud": { "userDataBase64": BASE64.encode(userdata) }
                    },
                ],
            },
        })
    }
}

#[async_trait]
impl CloudProvider for KubevirtProvider {
    fn name(&self) -> &'static str {
        "kubevirt"
    }

    async fn validate(&self, spec: &RawSpec) -> Result<(), ProviderError> {
        let resolved = self.resolve_spec(spec).await?;

        if resolved.cpus.parse::<u64>().is_err() {
            return Err(ProviderError::invalid_config(format!(
                "cpus {:?} is not a number",
                resolved.cpus
            )));
        }
        if !resolved.memory.ends_with("Mi") && !resolved.memory.ends_with("Gi") {
            return Err(ProviderError::invalid_config(format!(
                "memory {:?} must be a Mi/Gi quantity",
                resolved.memory
            )));
        }

        // Read-only reachability/auth check against the API group.
        let url = Self::vmi_collection_url(&resolved);
        self.api_get(&resolved, &url).await?;
        Ok(())
    }

    fn add_defaults(&self, mut spec: RawSpec) -> Result<RawSpec, ProviderError> {
        let obj = spec.as_object_mut().ok_or_else(|| {
            ProviderError::invalid_config("kubevirt spec must be an object")
        })?;
        obj.entry("namespace").or_insert(json!("default"));
        obj.entry("cpus").or_insert(json!("1"));
        Ok(spec)
    }

    async fn get(&self, machine: &Machine) -> Result<Instance, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let name = stable_vm_name(&machine.spec.provider_spec);
        let (status, vmi) = self.api_get(&resolved, &Self::vmi_url(&resolved, &name)).await?;
        if status == 404 {
            return Err(ProviderError::InstanceNotFound);
        }
        Ok(Self::vmi_to_instance(&resolved, &name, &vmi))
    }

    async fn create(
        &self,
        machine: &Machine,
        userdata: &str,
        _data: &ProviderData,
    ) -> Result<Instance, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let name = stable_vm_name(&machine.spec.provider_spec);

        let manifest = Self::vmi_manifest(&resolved, machine, &name, userdata);
        let url = Self::vmi_collection_url(&resolved);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&resolved.api_token)
            .json(&manifest)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 409 {
            // The stable name already exists: same spec, same VMI. Adopt.
            info!(vmi = %name, "VMI already exists, adopting");
            let (_, vmi) = self.api_get(&resolved, &Self::vmi_url(&resolved, &name)).await?;
            return Ok(Self::vmi_to_instance(&resolved, &name, &vmi));
        }
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http(status, &text));
        }

        let vmi: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Upstream(format!("decode: {}", e)))?;
        info!(vmi = %name, "VMI created");
        Ok(Self::vmi_to_instance(&resolved, &name, &vmi))
    }

    async fn cleanup(
        &self,
        machine: &Machine,
        _data: &ProviderData,
    ) -> Result<bool, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let name = stable_vm_name(&machine.spec.provider_spec);

        let resp = self
            .client
            .delete(Self::vmi_url(&resolved, &name))
            .bearer_auth(&resolved.api_token)
            .send()
            .await
            .map_err(|e| ProviderError::Upstream(e.to_string()))?;

        let status = resp.status().as_u16();
        if status == 404 {
            return Ok(true);
        }
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http(status, &text));
        }
        // Deletion is asynchronous; done once the VMI stops resolving.
        debug!(vmi = %name, "VMI delete accepted, in progress");
        Ok(false)
    }

    async fn migrate_uid(&self, _machine: &Machine, _new_uid: &Uid) -> Result<(), ProviderError> {
        // The stable name is derived from the spec, not the UID, so a UID
        // rewrite changes nothing on the backend.
        Ok(())
    }

    async fn cloud_config(&self, _spec: &RawSpec) -> Result<CloudConfig, ProviderError> {
        Ok(CloudConfig {
            config: String::new(),
            name: "kubevirt".to_string(),
        })
    }

    fn metrics_labels(&self, machine: &Machine) -> HashMap<String, String> {
        let mut labels = base_labels(machine);
        labels.insert(
            "vmi".to_string(),
            stable_vm_name(&machine.spec.provider_spec),
        );
        labels
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
