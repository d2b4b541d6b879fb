use std::collections::HashMap;

use async_trait::async_trait;
use machina_config::{DeclaredValue, Resolver};
use machina_domain::{AddressRole, Instance, InstanceStatus, Machine, RawSpec, Uid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{classify_http, ProviderError};
use crate::provider::{base_labels, CloudConfig, CloudProvider, ProviderData};

// ── Raw spec ──────────────────────────────────────────────────────────────────

/// The provider-spec shape for `provider: baremetal`, backed by a
/// tinkerbell-style metadata server. Connection fields default to the
/// conventional `METADATA_SERVER_*` environment references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaremetalSpec {
    #[serde(default = "default_endpoint")]
    pub endpoint: DeclaredValue,
    /// "none", "basic", or "token".
    #[serde(default = "default_auth_method")]
    pub auth_method: DeclaredValue,
    #[serde(default = "default_username")]
    pub username: DeclaredValue,
    #[serde(default = "default_password")]
    pub password: DeclaredValue,
    #[serde(default = "default_token")]
    pub token: DeclaredValue,
    /// Namespace the cloud-init secret is written into.
    #[serde(default = "default_cloud_init_namespace")]
    pub cloud_init_namespace: DeclaredValue,
    /// Pin provisioning to a specific hardware entry instead of letting the
    /// metadata server pick any healthy one.
    pub hardware_id: Option<DeclaredValue>,
}

fn default_endpoint() -> DeclaredValue {
    DeclaredValue::env("METADATA_SERVER_ENDPOINT")
}
fn default_auth_method() -> DeclaredValue {
    DeclaredValue::env("METADATA_SERVER_AUTH_METHOD")
}
fn default_username() -> DeclaredValue {
    DeclaredValue::env("METADATA_SERVER_USERNAME")
}
fn default_password() -> DeclaredValue {
    DeclaredValue::env("METADATA_SERVER_PASSWORD")
}
fn default_token() -> DeclaredValue {
    DeclaredValue::env("METADATA_SERVER_TOKEN")
}
fn default_cloud_init_namespace() -> DeclaredValue {
    DeclaredValue::literal("kube-system")
}

enum MetadataAuth {
    None,
    Basic { username: String, password: String },
    Token(String),
}

struct ResolvedSpec {
    endpoint: String,
    auth: MetadataAuth,
    cloud_init_namespace: String,
    hardware_id: Option<String>,
}

// ── Userdata inspection ───────────────────────────────────────────────────────

/// Pull the bootstrap token and API-server endpoint out of rendered
/// userdata. The driver needs both to register the server with the cluster
/// it is joining; userdata is the single source of truth for them.
pub fn extract_join_config(userdata: &str) -> Result<(String, String), ProviderError> {
    let mut token = None;
    let mut api_server = None;
    for line in userdata.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("token:") {
            token = Some(rest.trim().trim_matches('"').to_string());
        } else if let Some(rest) = line.strip_prefix("server:") {
            api_server = Some(rest.trim().trim_matches('"').to_string());
        }
    }
    match (token, api_server) {
        (Some(t), Some(s)) if !t.is_empty() && !s.is_empty() => Ok((t, s)),
        _ => Err(ProviderError::invalid_config(
            "userdata carries no bootstrap token/server for the metadata driver",
        )),
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct BaremetalProvider {
    resolver: Resolver,
    client: reqwest::Client,
}

impl BaremetalProvider {
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            client: reqwest::Client::new(),
        }
    }

    fn parse_spec(raw: &RawSpec) -> Result<BaremetalSpec, ProviderError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::invalid_config(format!("baremetal spec: {}", e)))
    }

    async fn resolve_spec(&self, raw: &RawSpec) -> Result<ResolvedSpec, ProviderError> {
        let spec = Self::parse_spec(raw)?;
        let r = &self.resolver;
        let invalid = |e: machina_config::ConfigError| ProviderError::invalid_config(e.to_string());

        let method = r.resolve(&spec.auth_method).await.map_err(invalid)?;
        let auth = match method.as_str() {
            "none" | "" => MetadataAuth::None,
            "basic" => MetadataAuth::Basic {
                username: r.resolve(&spec.username).await.map_err(invalid)?,
                password: r.resolve(&spec.password).await.map_err(invalid)?,
            },
            "token" => MetadataAuth::Token(r.resolve(&spec.token).await.map_err(invalid)?),
            other => {
                return Err(ProviderError::invalid_config(format!(
                    "unknown auth method {:?}",
                    other
                )))
            }
        };

        Ok(ResolvedSpec {
            endpoint: r
                .resolve(&spec.endpoint)
                .await
                .map_err(invalid)?
                .trim_end_matches('/')
                .to_string(),
            auth,
            cloud_init_namespace: r
                .resolve(&spec.cloud_init_namespace)
                .await
                .map_err(invalid)?,
            hardware_id: r
                .resolve_opt(spec.hardware_id.as_ref())
                .await
                .map_err(invalid)?,
        })
    }

    fn authed(
        &self,
        req: reqwest::RequestBuilder,
        resolved: &ResolvedSpec,
    ) -> reqwest::RequestBuilder {
        match &resolved.auth {
            MetadataAuth::None => req,
            MetadataAuth::Basic { username, password } => {
                req.basic_auth(username, Some(password))
            }
            MetadataAuth::Token(token) => req.bearer_auth(token),
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(u16, Value), ProviderError> {
        let resp = req
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
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| ProviderError::Upstream(format!("decode: {}", e)))?
        };
        Ok((status, body))
    }

    /// Identity tactic: the metadata server stores the machine UID as the
    /// server's asset tag; lookup is by that tag alone.
    async fn find_server(
        &self,
        resolved: &ResolvedSpec,
        uid: &Uid,
    ) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}/v1/servers?uid={}", resolved.endpoint, uid);
        let (_, body) = self.send(self.authed(self.client.get(&url), resolved)).await?;
        Ok(body["servers"]
            .as_array()
            .and_then(|servers| servers.first())
            .cloned())
    }

    fn server_to_instance(server: &Value) -> Instance {
        let id = server["id"].as_str().unwrap_or_default().to_string();
        let status = match server["status"].as_str().unwrap_or("") {
            "provisioned" => InstanceStatus::Running,
            "provisioning" => InstanceStatus::Creating,
            "deprovisioning" => InstanceStatus::Deleting,
            _ => InstanceStatus::Unknown,
        };

        let mut addresses = HashMap::new();
        for entry in server["addresses"].as_array().into_iter().flatten() {
            let Some(addr) = entry["address"].as_str() else { continue };
            let role = match entry["type"].as_str() {
                Some("external") => AddressRole::ExternalIp,
                Some("hostname") => AddressRole::Hostname,
                _ => AddressRole::InternalIp,
            };
            addresses.insert(addr.to_string(), role);
        }

        Instance {
            provider_uri: format!("baremetal:///{}", id),
            name: server["name"].as_str().unwrap_or_default().to_string(),
            status,
            addresses,
            id,
        }
    }

    fn cloud_init_url(resolved: &ResolvedSpec, name: &str) -> String {
        format!(
            "{}/v1/cloud-init/{}/{}",
            resolved.endpoint, resolved.cloud_init_namespace, name
        )
    }
}

#[async_trait]
impl CloudProvider for BaremetalProvider {
    fn name(&self) -> &'static str {
        "baremetal"
    }

    async fn validate(&self, spec: &RawSpec) -> Result<(), ProviderError> {
        let resolved = self.resolve_spec(spec).await?;
        // Reachability/auth check against the server inventory.
        let url = format!("{}/v1/servers", resolved.endpoint);
        self.send(self.authed(self.client.get(&url), &resolved)).await?;
        Ok(())
    }

    fn add_defaults(&self, mut spec: RawSpec) -> Result<RawSpec, ProviderError> {
        let obj = spec.as_object_mut().ok_or_else(|| {
            ProviderError::invalid_config("baremetal spec must be an object")
        })?;
        obj.entry("cloudInitNamespace").or_insert(json!("kube-system"));
        Ok(spec)
    }

    async fn get(&self, machine: &Machine) -> Result<Instance, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        match self.find_server(&resolved, &machine.uid).await? {
            Some(server) => Ok(Self::server_to_instance(&server)),
            None => Err(ProviderError::InstanceNotFound),
        }
    }

    async fn create(
        &self,
        machine: &Machine,
        userdata: &str,
        _data: &ProviderData,
    ) -> Result<Instance, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;

        if let Some(server) = self.find_server(&resolved, &machine.uid).await? {
            info!(machine = %machine.name, "create found existing server, adopting");
            return Ok(Self::server_to_instance(&server));
        }

        let (token, api_server) = extract_join_config(userdata)?;

        // The cloud-init secret is written first so a half-done provision can
        // always be retried against complete boot data.
        let url = Self::cloud_init_url(&resolved, &machine.name);
        let body = json!({ "userdata": userdata });
        self.send(self.authed(self.client.put(&url), &resolved).json(&body))
            .await?;
        debug!(machine = %machine.name, namespace = %resolved.cloud_init_namespace, "cloud-init secret written");

        let mut provision = json!({
            "name": machine.name,
            "uid": machine.uid.as_str(),
            "cloud_init_secret": machine.name,
            "token": token,
            "api_server": api_server,
        });
        if let Some(hw) = &resolved.hardware_id {
            provision["hardware_id"] = json!(hw);
        }
        let url = format!("{}/v1/servers/provision", resolved.endpoint);
        let (_, body) = self
            .send(self.authed(self.client.post(&url), &resolved).json(&provision))
            .await?;
        info!(machine = %machine.name, "server provisioning requested");
        Ok(Self::server_to_instance(&body["server"]))
    }

    async fn cleanup(
        &self,
        machine: &Machine,
        _data: &ProviderData,
    ) -> Result<bool, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;

        if let Some(server) = self.find_server(&resolved, &machine.uid).await? {
            let id = server["id"].as_str().unwrap_or_default();
            let url = format!("{}/v1/servers/{}", resolved.endpoint, id);
            self.send(self.authed(self.client.delete(&url), &resolved))
                .await?;
            debug!(machine = %machine.name, server = id, "deprovision requested");
            // Secret removal and the done verdict wait for the next pass,
            // once the server is out of the inventory.
            return Ok(false);
        }

        // Server gone; remove the boot data as well. 404 means a previous
        // pass already did.
        let url = Self::cloud_init_url(&resolved, &machine.name);
        self.send(self.authed(self.client.delete(&url), &resolved))
            .await?;
        Ok(true)
    }

    async fn migrate_uid(&self, machine: &Machine, new_uid: &Uid) -> Result<(), ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let Some(server) = self.find_server(&resolved, &machine.uid).await? else {
            return Ok(());
        };
        let id = server["id"].as_str().unwrap_or_default();
        let url = format!("{}/v1/servers/{}/uid", resolved.endpoint, id);
        self.send(
            self.authed(self.client.post(&url), &resolved)
                .json(&json!({ "uid": new_uid.as_str() })),
        )
        .await?;
        info!(machine = %machine.name, server = id, new_uid = %new_uid, "asset tag rewritten");
        Ok(())
    }

    async fn cloud_config(&self, _spec: &RawSpec) -> Result<CloudConfig, ProviderError> {
        // Bare metal has no cloud-provider integration; the kubelet runs
        // without one.
        Ok(CloudConfig {
            config: String::new(),
            name: String::new(),
        })
    }

    fn metrics_labels(&self, machine: &Machine) -> HashMap<String, String> {
        base_labels(machine)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use machina_domain::{
        MachineSpec, MachineStatus, MachineVersions, OperatingSystem, ProviderKind,
    };
    use machina_store::InMemoryStore;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USERDATA: &str = "#cloud-config\n\
        write_files: []\n\
        token: abcdef.0123456789abcdef\n\
        server: https://api.cluster.example.com:6443\n";

    fn spec(server: &MockServer) -> RawSpec {
        json!({
            "endpoint": server.uri(),
            "authMethod": "token",
            "token": "metadata-token",
        })
    }

    fn machine(provider_spec: RawSpec) -> Machine {
        Machine {
            name: "bm-1".to_string(),
            namespace: "default".to_string(),
            uid: Uid::new("u4"),
            spec: MachineSpec {
                provider: ProviderKind::Baremetal,
                provider_spec,
                operating_system: OperatingSystem::Flatcar,
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

    async fn mock_no_servers(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v1/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "servers": [] })))
            .mount(server)
            .await;
    }

    // ── extract_join_config ───────────────────────────────────────────────────

    #[test]
    fn extracts_token_and_api_server_from_userdata() {
        let (token, api_server) = extract_join_config(USERDATA).unwrap();
        assert_eq!(token, "abcdef.0123456789abcdef");
        assert_eq!(api_server, "https://api.cluster.example.com:6443");
    }

    #[test]
    fn userdata_without_join_config_is_terminal() {
        let err = extract_join_config("#cloud-config\nwrite_files: []\n").unwrap_err();
        assert!(err.is_terminal());
    }

    // ── create (S4) ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_writes_cloud_init_secret_then_provisions() {
        let server = MockServer::start().await;
        mock_no_servers(&server).await;
        Mock::given(method("PUT"))
            .and(path("/v1/cloud-init/kube-system/bm-1"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/servers/provision"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": {
                    "id": "hw-7",
                    "name": "bm-1",
                    "status": "provisioning",
                    "addresses": [],
                }
            })))
            .mount(&server)
            .await;

        let p = BaremetalProvider::new(Resolver::without_secrets());
        let m = machine(p.add_defaults(spec(&server)).unwrap());

        let instance = p.create(&m, USERDATA, &data()).await.unwrap();
        assert_eq!(instance.id, "hw-7");
        assert_eq!(instance.status, InstanceStatus::Creating);

        let requests = server.received_requests().await.unwrap();
        let put = requests
            .iter()
            .find(|r| r.method.as_str() == "PUT")
            .expect("cloud-init secret not written");
        assert_eq!(put.url.path(), "/v1/cloud-init/kube-system/bm-1");

        let provision = requests
            .iter()
            .find(|r| r.url.path() == "/v1/servers/provision")
            .expect("provision not requested");
        let body: Value = serde_json::from_slice(&provision.body).unwrap();
        assert_eq!(body["token"], "abcdef.0123456789abcdef");
        assert_eq!(body["api_server"], "https://api.cluster.example.com:6443");
        assert_eq!(body["uid"], "u4");
        assert_eq!(body["cloud_init_secret"], "bm-1");
    }

    #[tokio::test]
    async fn create_adopts_server_with_matching_uid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/servers"))
            .and(query_param("uid", "u4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "servers": [{
                    "id": "hw-7",
                    "name": "bm-1",
                    "status": "provisioned",
                    "addresses": [ { "address": "10.1.2.3", "type": "internal" } ],
                }]
            })))
            .mount(&server)
            .await;

        let p = BaremetalProvider::new(Resolver::without_secrets());
        let m = machine(p.add_defaults(spec(&server)).unwrap());

        let instance = p.create(&m, USERDATA, &data()).await.unwrap();
        assert_eq!(instance.id, "hw-7");
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(
            instance.address_of(AddressRole::InternalIp),
            Some("10.1.2.3")
        );
    }

    // ── cleanup (S4) ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_deprovisions_then_deletes_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/servers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "servers": [ { "id": "hw-7", "name": "bm-1", "status": "provisioned" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/servers/hw-7"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let p = BaremetalProvider::new(Resolver::without_secrets());
        let m = machine(p.add_defaults(spec(&server)).unwrap());

        // First pass: server still present, deprovision requested.
        assert!(!p.cleanup(&m, &data()).await.unwrap());

        // Second pass: inventory is empty; the secret is removed and we're done.
        server.reset().await;
        mock_no_servers(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/v1/cloud-init/kube-system/bm-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        assert!(p.cleanup(&m, &data()).await.unwrap());

        let requests = server.received_requests().await.unwrap();
        assert!(requests
            .iter()
            .any(|r| r.url.path() == "/v1/cloud-init/kube-system/bm-1"
                && r.method.as_str() == "DELETE"));
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_secret() {
        let server = MockServer::start().await;
        mock_no_servers(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/v1/cloud-init/kube-system/bm-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let p = BaremetalProvider::new(Resolver::without_secrets());
        let m = machine(p.add_defaults(spec(&server)).unwrap());
        assert!(p.cleanup(&m, &data()).await.unwrap());
    }

    // ── migrate_uid ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn migrate_uid_rewrites_asset_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/servers"))
            .and(query_param("uid", "u4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "servers": [ { "id": "hw-7", "name": "bm-1", "status": "provisioned" } ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/servers/hw-7/uid"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let p = BaremetalProvider::new(Resolver::without_secrets());
        let m = machine(p.add_defaults(spec(&server)).unwrap());
        p.migrate_uid(&m, &Uid::new("u5")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let post = requests
            .iter()
            .find(|r| r.url.path() == "/v1/servers/hw-7/uid")
            .expect("uid rewrite not sent");
        let body: Value = serde_json::from_slice(&post.body).unwrap();
        assert_eq!(body["uid"], "u5");
    }

    // ── auth ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_auth_method_is_terminal() {
        let server = MockServer::start().await;
        let p = BaremetalProvider::new(Resolver::without_secrets());
        let err = p
            .validate(&json!({
                "endpoint": server.uri(),
                "authMethod": "kerberos",
            }))
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }
}
