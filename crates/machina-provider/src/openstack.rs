use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use machina_config::{DeclaredValue, Resolver};
use machina_domain::{
    AddressRole, ErrorReason, Instance, InstanceStatus, Machine, RawSpec, Uid,
};
use machina_store::MachineStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{classify_http, ProviderError};
use crate::poll::poll_until;
use crate::provider::{base_labels, CloudConfig, CloudProvider, FinalizerHook, ProviderData};

/// Finalizer (and identically-named annotation key) recording a floating IP
/// this controller allocated and must release on delete.
pub const FLOATING_IP_FINALIZER: &str = "machina.dev/release-openstack-floating-ip";

/// Metadata key carrying the machine UID on every server we create.
const METADATA_UID_KEY: &str = "machine-uid";

/// Metadata key tying a server to the cluster this controller manages.
const METADATA_CLUSTER_KEY: &str = "kubernetes-cluster";

const DEFAULT_SECURITY_GROUP: &str = "kubernetes-v1";
const DEFAULT_READY_PERIOD: &str = "5s";
const DEFAULT_READY_TIMEOUT: &str = "10s";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Operator-level settings for the OpenStack backend, injected at startup.
/// Not stored in per-machine specs. Endpoints point at the Nova and Neutron
/// service roots; tests override them with a mock server.
#[derive(Clone)]
pub struct OpenstackConfig {
    /// Cluster tag written into every server's metadata.
    pub cluster_name: String,
    /// Nova root, e.g. `https://nova.example.com/v2.1`.
    pub compute_endpoint: String,
    /// Neutron root, e.g. `https://neutron.example.com`.
    pub network_endpoint: String,
}

// ── Raw spec ──────────────────────────────────────────────────────────────────

/// The provider-spec shape for `provider: openstack`. Credential fields
/// default to the conventional `OS_*` environment references; any of them
/// may instead be a literal or a secret reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackSpec {
    #[serde(default = "default_auth_url")]
    pub identity_endpoint: DeclaredValue,
    #[serde(default = "default_username")]
    pub username: DeclaredValue,
    #[serde(default = "default_password")]
    pub password: DeclaredValue,
    #[serde(default = "default_project_name")]
    pub project_name: DeclaredValue,
    #[serde(default = "default_domain_name")]
    pub domain_name: DeclaredValue,
    /// Application-credential auth; when set, username/password are unused.
    pub application_credential_id: Option<DeclaredValue>,
    pub application_credential_secret: Option<DeclaredValue>,

    pub region: Option<DeclaredValue>,
    pub flavor: DeclaredValue,
    pub image: DeclaredValue,
    pub network: DeclaredValue,
    #[serde(default)]
    pub security_groups: Vec<DeclaredValue>,
    #[serde(rename = "floatingIPPool")]
    pub floating_ip_pool: Option<DeclaredValue>,
    pub availability_zone: Option<DeclaredValue>,
    #[serde(rename = "rootDiskSizeGB")]
    pub root_disk_size_gb: Option<u64>,
    #[serde(default)]
    pub tags: HashMap<String, String>,

    pub ssh_key_name: Option<DeclaredValue>,
    pub ssh_public_key: Option<DeclaredValue>,

    pub instance_ready_check_period: Option<DeclaredValue>,
    pub instance_ready_check_timeout: Option<DeclaredValue>,
}

fn default_auth_url() -> DeclaredValue {
    DeclaredValue::env("OS_AUTH_URL")
}
fn default_username() -> DeclaredValue {
    DeclaredValue::env("OS_USERNAME")
}
fn default_password() -> DeclaredValue {
    DeclaredValue::env("OS_PASSWORD")
}
fn default_project_name() -> DeclaredValue {
    DeclaredValue::env("OS_PROJECT_NAME")
}
fn default_domain_name() -> DeclaredValue {
    DeclaredValue::env("OS_DOMAIN_NAME")
}

/// Everything resolved to concrete values, ready for API calls.
struct ResolvedSpec {
    auth: AuthInfo,
    region: Option<String>,
    flavor: String,
    image: String,
    network: String,
    security_groups: Vec<String>,
    floating_ip_pool: Option<String>,
    availability_zone: Option<String>,
    root_disk_size_gb: Option<u64>,
    tags: HashMap<String, String>,
    ssh_key_name: Option<String>,
    ssh_public_key: Option<String>,
    ready_period: Duration,
    ready_timeout: Duration,
}

// ── Token provider ────────────────────────────────────────────────────────────

/// Resolved credentials handed to the token provider.
struct AuthInfo {
    auth_url: String,
    username: String,
    password: String,
    project_name: String,
    domain_name: String,
    application_credential_id: Option<String>,
    application_credential_secret: Option<String>,
}

/// Abstraction over Keystone token acquisition — enables test injection.
#[async_trait]
trait TokenProvider: Send + Sync {
    async fn token(
        &self,
        client: &reqwest::Client,
        auth: &AuthInfo,
    ) -> Result<String, ProviderError>;
}

/// Production token provider: Keystone v3 password or application-credential
/// grant, token returned in the `X-Subject-Token` header.
struct KeystoneToken;

#[async_trait]
impl TokenProvider for KeystoneToken {
    async fn token(
        &self,
        client: &reqwest::Client,
        auth: &AuthInfo,
    ) -> Result<String, ProviderError> {
        let body = match (&auth.application_credential_id, &auth.application_credential_secret) {
            (Some(id), Some(secret)) => json!({
                "auth": {
                    "identity": {
                        "methods": ["application_credential"],
                        "application_credential": { "id": id, "secret": secret },
                    }
                }
            }),
            _ => json!({
                "auth": {
                    "identity": {
                        "methods": ["password"],
                        "password": {
                            "user": {
                                "name": auth.username,
                                "domain": { "name": auth.domain_name },
                                "password": auth.password,
                            }
                        }
                    },
                    "scope": {
                        "project": {
                            "name": auth.project_name,
                            "domain": { "name": auth.domain_name },
                        }
                    }
                }
            }),
        };

        let url = format!("{}/v3/auth/tokens", auth.auth_url.trim_end_matches('/'));
        let resp = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http(status, &text));
        }

        resp.headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| {
                ProviderError::Upstream("keystone response missing X-Subject-Token".into())
            })
    }
}

/// Test token provider — returns a fixed string without any network call.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(
        &self,
        _client: &reqwest::Client,
        _auth: &AuthInfo,
    ) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }
}

fn request_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Upstream(e.to_string())
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct OpenstackProvider {
    config: OpenstackConfig,
    resolver: Resolver,
    client: reqwest::Client,
    token: Box<dyn TokenProvider>,
    /// Guards free-floating-IP selection so two machines can't claim the
    /// same address.
    floating_ip_lock: Mutex<()>,
    /// Guards security-group ensure so concurrent creates don't race to
    /// create duplicate groups of the same name.
    security_group_lock: Mutex<()>,
    /// Guards SSH keypair upsert.
    ssh_key_lock: Mutex<()>,
}

impl OpenstackProvider {
    pub fn new(config: OpenstackConfig, resolver: Resolver) -> Self {
        Self::with_token(config, resolver, Box::new(KeystoneToken))
    }

    fn with_token(
        config: OpenstackConfig,
        resolver: Resolver,
        token: Box<dyn TokenProvider>,
    ) -> Self {
        Self {
            config,
            resolver,
            client: reqwest::Client::new(),
            token,
            floating_ip_lock: Mutex::new(()),
            security_group_lock: Mutex::new(()),
            ssh_key_lock: Mutex::new(()),
        }
    }

    /// Static-token constructor used exclusively in tests.
    #[cfg(test)]
    fn with_static_token(config: OpenstackConfig, resolver: Resolver, token: &str) -> Self {
        Self::with_token(config, resolver, Box::new(StaticToken(token.to_string())))
    }

    fn compute(&self) -> &str {
        self.config.compute_endpoint.trim_end_matches('/')
    }

    fn network(&self) -> &str {
        self.config.network_endpoint.trim_end_matches('/')
    }

    // ── Spec handling ─────────────────────────────────────────────────────────

    fn parse_spec(raw: &RawSpec) -> Result<OpenstackSpec, ProviderError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::invalid_config(format!("openstack spec: {}", e)))
    }

    async fn resolve_spec(&self, raw: &RawSpec) -> Result<ResolvedSpec, ProviderError> {
        let spec = Self::parse_spec(raw)?;
        let r = &self.resolver;

        let invalid = |e: machina_config::ConfigError| ProviderError::invalid_config(e.to_string());

        let application_credential_id = r
            .resolve_opt(spec.application_credential_id.as_ref())
            .await
            .map_err(invalid)?;
        let application_credential_secret = r
            .resolve_opt(spec.application_credential_secret.as_ref())
            .await
            .map_err(invalid)?;

        // Username/password are only pulled when application credentials are
        // absent, so app-credential users don't need OS_USERNAME set.
        let (username, password) = if application_credential_id.is_some() {
            (String::new(), String::new())
        } else {
            (
                r.resolve(&spec.username).await.map_err(invalid)?,
                r.resolve(&spec.password).await.map_err(invalid)?,
            )
        };

        let auth = AuthInfo {
            auth_url: r.resolve(&spec.identity_endpoint).await.map_err(invalid)?,
            username,
            password,
            project_name: r.resolve(&spec.project_name).await.map_err(invalid)?,
            domain_name: r.resolve(&spec.domain_name).await.map_err(invalid)?,
            application_credential_id,
            application_credential_secret,
        };

        let mut security_groups = Vec::new();
        for group in &spec.security_groups {
            security_groups.push(r.resolve(group).await.map_err(invalid)?);
        }

        let ready_period = match &spec.instance_ready_check_period {
            Some(v) => r.resolve_duration(v).await.map_err(invalid)?,
            None => Duration::from_secs(5),
        };
        let ready_timeout = match &spec.instance_ready_check_timeout {
            Some(v) => r.resolve_duration(v).await.map_err(invalid)?,
            None => Duration::from_secs(10),
        };

        Ok(ResolvedSpec {
            auth,
            region: r.resolve_opt(spec.region.as_ref()).await.map_err(invalid)?,
            flavor: r.resolve(&spec.flavor).await.map_err(invalid)?,
            image: r.resolve(&spec.image).await.map_err(invalid)?,
            network: r.resolve(&spec.network).await.map_err(invalid)?,
            security_groups,
            floating_ip_pool: r
                .resolve_opt(spec.floating_ip_pool.as_ref())
                .await
                .map_err(invalid)?,
            availability_zone: r
                .resolve_opt(spec.availability_zone.as_ref())
                .await
                .map_err(invalid)?,
            root_disk_size_gb: spec.root_disk_size_gb,
            tags: spec.tags,
            ssh_key_name: r
                .resolve_opt(spec.ssh_key_name.as_ref())
                .await
                .map_err(invalid)?,
            ssh_public_key: r
                .resolve_opt(spec.ssh_public_key.as_ref())
                .await
                .map_err(invalid)?,
            ready_period,
            ready_timeout,
        })
    }

    // ── HTTP helpers ──────────────────────────────────────────────────────────

    async fn os_get(&self, token: &str, url: &str) -> Result<Value, ProviderError> {
        debug!(url, "openstack GET");
        let resp = self
            .client
            .get(url)
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(request_error)?;
        Self::decode(resp).await
    }

    async fn os_post(&self, token: &str, url: &str, body: &Value) -> Result<Value, ProviderError> {
        debug!(url, "openstack POST");
        let resp = self
            .client
            .post(url)
            .header("X-Auth-Token", token)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        Self::decode(resp).await
    }

    /// Returns the status code; callers decide what 404 means.
    async fn os_delete(&self, token: &str, url: &str) -> Result<u16, ProviderError> {
        debug!(url, "openstack DELETE");
        let resp = self
            .client
            .delete(url)
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status().as_u16();
        if (200..300).contains(&status) || status == 404 {
            return Ok(status);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_http(status, &text))
    }

    async fn decode(resp: reqwest::Response) -> Result<Value, ProviderError> {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(classify_http(status, &text));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Upstream(format!("decode {}: {}", status, e)))
    }

    // ── Server lookup & mapping ───────────────────────────────────────────────

    /// Find the server bound to this machine: same display name AND metadata
    /// `machine-uid` matching. Name alone is not identity — a stale server
    /// from a previous UID must not be adopted.
    async fn find_server(
        &self,
        token: &str,
        machine: &Machine,
    ) -> Result<Option<Value>, ProviderError> {
        let url = format!("{}/servers/detail?name={}", self.compute(), machine.name);
        let resp = self.os_get(token, &url).await?;
        let found = resp["servers"].as_array().and_then(|servers| {
            servers
                .iter()
                .find(|s| s["metadata"][METADATA_UID_KEY] == machine.uid.as_str())
                .cloned()
        });
        Ok(found)
    }

    fn server_to_instance(server: &Value) -> Instance {
        let id = server["id"].as_str().unwrap_or_default().to_string();
        let status = match server["status"].as_str().unwrap_or("") {
            "ACTIVE" => InstanceStatus::Running,
            "BUILD" | "REBUILD" => InstanceStatus::Creating,
            "DELETED" | "SOFT_DELETED" => InstanceStatus::Deleting,
            _ => InstanceStatus::Unknown,
        };

        let mut addresses = HashMap::new();
        if let Some(networks) = server["addresses"].as_object() {
            for entries in networks.values() {
                for entry in entries.as_array().into_iter().flatten() {
                    let Some(addr) = entry["addr"].as_str() else { continue };
                    let role = match entry["OS-EXT-IPS:type"].as_str() {
                        Some("floating") => AddressRole::ExternalIp,
                        _ => AddressRole::InternalIp,
                    };
                    addresses.insert(addr.to_string(), role);
                }
            }
        }

        Instance {
            provider_uri: format!("openstack:///{}", id),
            name: server["name"].as_str().unwrap_or_default().to_string(),
            status,
            addresses,
            id,
        }
    }

    // ── Ensure helpers (guarded critical sections) ────────────────────────────

    async fn ensure_security_groups(
        &self,
        token: &str,
        groups: &[String],
    ) -> Result<(), ProviderError> {
        let _guard = self.security_group_lock.lock().await;
        for group in groups {
            let url = format!("{}/v2.0/security-groups?name={}", self.network(), group);
            let resp = self.os_get(token, &url).await?;
            let exists = resp["security_groups"]
                .as_array()
                .map(|a| !a.is_empty())
                .unwrap_or(false);
            if exists {
                continue;
            }
            info!(group, "creating security group");
            let body = json!({
                "security_group": {
                    "name": group,
                    "description": "managed by machina",
                }
            });
            let url = format!("{}/v2.0/security-groups", self.network());
            self.os_post(token, &url, &body).await?;
        }
        Ok(())
    }

    async fn ensure_keypair(
        &self,
        token: &str,
        name: &str,
        public_key: &str,
    ) -> Result<(), ProviderError> {
        let _guard = self.ssh_key_lock.lock().await;
        let url = format!("{}/os-keypairs/{}", self.compute(), name);
        let resp = self
            .client
            .get(&url)
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(request_error)?;
        if resp.status().as_u16() != 404 {
            // Existing keypair (or a hard error surfaced on the next call).
            return Ok(());
        }

        info!(keypair = name, "uploading SSH keypair");
        let body = json!({
            "keypair": { "name": name, "public_key": public_key }
        });
        let url = format!("{}/os-keypairs", self.compute());
        self.os_post(token, &url, &body).await?;
        Ok(())
    }

    /// Pick or allocate a floating IP for this machine, returning (id, addr).
    ///
    /// Availability filter is deliberately broad: any address that is not in
    /// ERROR and has neither a port nor a fixed IP bound is free. Classic
    /// load balancers never populate `port_id`, so filtering on
    /// `status == ACTIVE` alone would leak those back into rotation.
    ///
    /// Newly-allocated addresses are owned by this controller: the machine
    /// gains the release finalizer plus an annotation carrying the address
    /// id BEFORE the server create, so a cancelled reconcile can't leak it.
    async fn ensure_floating_ip(
        &self,
        token: &str,
        machine: &Machine,
        pool: &str,
        data: &ProviderData,
    ) -> Result<(String, String), ProviderError> {
        let _guard = self.floating_ip_lock.lock().await;

        // Re-entrant: a previous pass may already have allocated one.
        if let Some(id) = machine.annotation(FLOATING_IP_FINALIZER) {
            let url = format!("{}/v2.0/floatingips/{}", self.network(), id);
            let resp = self.os_get(token, &url).await?;
            if let Some(addr) = resp["floatingip"]["floating_ip_address"].as_str() {
                return Ok((id.to_string(), addr.to_string()));
            }
        }

        let url = format!("{}/v2.0/networks?name={}", self.network(), pool);
        let resp = self.os_get(token, &url).await?;
        let pool_id = resp["networks"][0]["id"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::invalid_config(format!("floating IP pool {:?} not found", pool))
            })?
            .to_string();

        let url = format!(
            "{}/v2.0/floatingips?floating_network_id={}",
            self.network(),
            pool_id
        );
        let resp = self.os_get(token, &url).await?;
        let free = resp["floatingips"].as_array().and_then(|fips| {
            fips.iter().find(|f| {
                f["status"].as_str() != Some("ERROR")
                    && f["port_id"].as_str().unwrap_or("").is_empty()
                    && f["fixed_ip_address"].as_str().unwrap_or("").is_empty()
            })
        });

        if let Some(fip) = free {
            let id = fip["id"].as_str().unwrap_or_default().to_string();
            let addr = fip["floating_ip_address"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            debug!(fip = %addr, "reusing free floating IP");
            return Ok((id, addr));
        }

        info!(pool, "allocating new floating IP");
        let body = json!({ "floatingip": { "floating_network_id": pool_id } });
        let url = format!("{}/v2.0/floatingips", self.network());
        let resp = self.os_post(token, &url, &body).await?;
        let id = resp["floatingip"]["id"].as_str().unwrap_or_default().to_string();
        let addr = resp["floatingip"]["floating_ip_address"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        // Persist ownership before anything else can be abandoned.
        let fip_id = id.clone();
        data.store
            .update(&machine.namespace, &machine.name, &move |m| {
                m.finalizers.add(FLOATING_IP_FINALIZER);
                m.set_annotation(FLOATING_IP_FINALIZER, fip_id.clone());
            })
            .await?;

        Ok((id, addr))
    }

    async fn flavor_id(&self, token: &str, name: &str) -> Result<String, ProviderError> {
        let url = format!("{}/flavors", self.compute());
        let resp = self.os_get(token, &url).await?;
        resp["flavors"]
            .as_array()
            .and_then(|flavors| {
                flavors
                    .iter()
                    .find(|f| f["name"] == name || f["id"] == name)
            })
            .and_then(|f| f["id"].as_str())
            .map(String::from)
            .ok_or_else(|| ProviderError::invalid_config(format!("flavor {:?} not found", name)))
    }
}

#[async_trait]
impl CloudProvider for OpenstackProvider {
    fn name(&self) -> &'static str {
        "openstack"
    }

    async fn validate(&self, spec: &RawSpec) -> Result<(), ProviderError> {
        let resolved = self.resolve_spec(spec).await?;
        let token = self.token.token(&self.client, &resolved.auth).await?;

        // Read-only upstream checks: flavor and network must exist.
        self.flavor_id(&token, &resolved.flavor).await?;

        let url = format!("{}/v2.0/networks?name={}", self.network(), resolved.network);
        let resp = self.os_get(&token, &url).await?;
        let network_exists = resp["networks"]
            .as_array()
            .map(|a| !a.is_empty())
            .unwrap_or(false);
        if !network_exists {
            return Err(ProviderError::invalid_config(format!(
                "network {:?} not found",
                resolved.network
            )));
        }
        Ok(())
    }

    fn add_defaults(&self, mut spec: RawSpec) -> Result<RawSpec, ProviderError> {
        let obj = spec.as_object_mut().ok_or_else(|| {
            ProviderError::invalid_config("openstack spec must be an object")
        })?;

        let groups = obj
            .entry("securityGroups")
            .or_insert_with(|| json!([]));
        if groups.as_array().map(|a| a.is_empty()).unwrap_or(false) {
            *groups = json!([DEFAULT_SECURITY_GROUP]);
        }
        obj.entry("instanceReadyCheckPeriod")
            .or_insert_with(|| json!(DEFAULT_READY_PERIOD));
        obj.entry("instanceReadyCheckTimeout")
            .or_insert_with(|| json!(DEFAULT_READY_TIMEOUT));

        Ok(spec)
    }

    async fn get(&self, machine: &Machine) -> Result<Instance, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let token = self.token.token(&self.client, &resolved.auth).await?;
        match self.find_server(&token, machine).await? {
            Some(server) => Ok(Self::server_to_instance(&server)),
            None => Err(ProviderError::InstanceNotFound),
        }
    }

    async fn create(
        &self,
        machine: &Machine,
        userdata: &str,
        data: &ProviderData,
    ) -> Result<Instance, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let token = self.token.token(&self.client, &resolved.auth).await?;

        // Create may race a restart that lost the status write. The metadata
        // tag makes the existing server discoverable; adopt it as success.
        if let Some(server) = self.find_server(&token, machine).await? {
            info!(machine = %machine.name, "create found existing server, adopting");
            return Ok(Self::server_to_instance(&server));
        }

        self.ensure_security_groups(&token, &resolved.security_groups)
            .await?;

        if let (Some(name), Some(key)) = (&resolved.ssh_key_name, &resolved.ssh_public_key) {
            self.ensure_keypair(&token, name, key).await?;
        }

        let floating_ip = match &resolved.floating_ip_pool {
            Some(pool) => Some(
                self.ensure_floating_ip(&token, machine, pool, data)
                    .await?,
            ),
            None => None,
        };

        let flavor_ref = self.flavor_id(&token, &resolved.flavor).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(METADATA_UID_KEY.into(), json!(machine.uid.as_str()));
        metadata.insert(
            METADATA_CLUSTER_KEY.into(),
            json!(self.config.cluster_name),
        );
        for (k, v) in &resolved.tags {
            metadata.insert(k.clone(), json!(v));
        }

        let mut server = json!({
            "name": machine.name,
            "flavorRef": flavor_ref,
            "imageRef": resolved.image,
            "networks": [ { "uuid": resolved.network } ],
            "security_groups": resolved.security_groups.iter()
                .map(|g| json!({ "name": g }))
                .collect::<Vec<_>>(),
            "metadata": metadata,
            "user_data": BASE64.encode(userdata),
        });
        if let Some(az) = &resolved.availability_zone {
            server["availability_zone"] = json!(az);
        }
        if let Some(name) = &resolved.ssh_key_name {
            server["key_name"] = json!(name);
        }
        if let Some(size) = resolved.root_disk_size_gb {
            // Boot from volume: the image reference moves into the block
            // device mapping and the bare imageRef must be empty.
            server["imageRef"] = json!("");
            server["block_device_mapping_v2"] = json!([{
                "boot_index": 0,
                "delete_on_termination": true,
                "source_type": "image",
                "destination_type": "volume",
                "uuid": resolved.image,
                "volume_size": size,
            }]);
        }

        let url = format!("{}/servers", self.compute());
        let resp = self.os_post(&token, &url, &json!({ "server": server })).await?;
        let server_id = resp["server"]["id"]
            .as_str()
            .ok_or_else(|| ProviderError::Upstream("server create response missing id".into()))?
            .to_string();
        info!(machine = %machine.name, server_id = %server_id, "server created");

        if let Some((_, addr)) = &floating_ip {
            let url = format!("{}/servers/{}/action", self.compute(), server_id);
            self.os_post(&token, &url, &json!({ "addFloatingIp": { "address": addr } }))
                .await?;
        }

        // Bounded readiness wait. Not reaching ACTIVE in time is not an
        // error: the instance is returned as-is and the engine requeues.
        let ready = poll_until(
            resolved.ready_period,
            resolved.ready_timeout,
            "server ACTIVE",
            || async {
                let url = format!("{}/servers/{}", self.compute(), server_id);
                let resp = self.os_get(&token, &url).await?;
                let server = &resp["server"];
                match server["status"].as_str() {
                    Some("ACTIVE") => Ok(Some(server.clone())),
                    Some("ERROR") => Err(ProviderError::terminal(
                        ErrorReason::CreateMachineError,
                        format!("server {} entered ERROR during build", server_id),
                    )),
                    _ => Ok(None),
                }
            },
        )
        .await;

        match ready {
            Ok(server) => Ok(Self::server_to_instance(&server)),
            Err(ProviderError::Timeout(msg)) => {
                warn!(machine = %machine.name, %msg, "server not ACTIVE yet, handing back to requeue");
                let url = format!("{}/servers/{}", self.compute(), server_id);
                let resp = self.os_get(&token, &url).await?;
                Ok(Self::server_to_instance(&resp["server"]))
            }
            Err(other) => Err(other),
        }
    }

    async fn cleanup(
        &self,
        machine: &Machine,
        _data: &ProviderData,
    ) -> Result<bool, ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let token = self.token.token(&self.client, &resolved.auth).await?;

        let Some(server) = self.find_server(&token, machine).await? else {
            return Ok(true);
        };
        let server_id = server["id"].as_str().unwrap_or_default();

        let url = format!("{}/servers/{}", self.compute(), server_id);
        let status = self.os_delete(&token, &url).await?;
        if status == 404 {
            return Ok(true);
        }

        // Nova deletes asynchronously; report in-progress and let the engine
        // requeue until the server stops showing up.
        debug!(machine = %machine.name, server_id, "server delete accepted, in progress");
        Ok(false)
    }

    async fn migrate_uid(&self, machine: &Machine, new_uid: &Uid) -> Result<(), ProviderError> {
        let resolved = self.resolve_spec(&machine.spec.provider_spec).await?;
        let token = self.token.token(&self.client, &resolved.auth).await?;

        let Some(server) = self.find_server(&token, machine).await? else {
            // Nothing tagged with the old UID; nothing to relabel.
            return Ok(());
        };
        let server_id = server["id"].as_str().unwrap_or_default();

        let url = format!("{}/servers/{}/metadata", self.compute(), server_id);
        let body = json!({ "metadata": { METADATA_UID_KEY: new_uid.as_str() } });
        self.os_post(&token, &url, &body).await?;
        info!(machine = %machine.name, server_id, new_uid = %new_uid, "migrated server UID tag");
        Ok(())
    }

    async fn cloud_config(&self, spec: &RawSpec) -> Result<CloudConfig, ProviderError> {
        let resolved = self.resolve_spec(spec).await?;
        let mut config = String::new();
        config.push_str("[Global]\n");
        config.push_str(&format!("auth-url = {}\n", resolved.auth.auth_url));
        if resolved.auth.application_credential_id.is_none() {
            config.push_str(&format!("username = {}\n", resolved.auth.username));
            config.push_str(&format!("password = {}\n", resolved.auth.password));
        }
        config.push_str(&format!("tenant-name = {}\n", resolved.auth.project_name));
        config.push_str(&format!("domain-name = {}\n", resolved.auth.domain_name));
        if let Some(region) = &resolved.region {
            config.push_str(&format!("region = {}\n", region));
        }
        Ok(CloudConfig {
            config,
            name: "openstack".to_string(),
        })
    }

    fn metrics_labels(&self, machine: &Machine) -> HashMap<String, String> {
        let mut labels = base_labels(machine);
        // Only literal spec fields are safe to label with; refs would force
        // resolution here.
        if let Some(flavor) = machine.spec.provider_spec["flavor"].as_str() {
            labels.insert("flavor".to_string(), flavor.to_string());
        }
        labels
    }
}

// ── Floating IP release finalizer ─────────────────────────────────────────────

/// Deletes the floating IP recorded in the machine's annotation, then removes
/// the annotation/finalizer pair. Idempotent: a 404 from Neutron means the
/// address is already gone.
pub struct ReleaseFloatingIp {
    provider: Arc<OpenstackProvider>,
}

impl ReleaseFloatingIp {
    pub fn new(provider: Arc<OpenstackProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl FinalizerHook for ReleaseFloatingIp {
    fn name(&self) -> &'static str {
        FLOATING_IP_FINALIZER
    }

    async fn run(
        &self,
        machine: &Machine,
        store: &Arc<dyn MachineStore>,
    ) -> Result<(), ProviderError> {
        if let Some(fip_id) = machine.annotation(FLOATING_IP_FINALIZER) {
            let resolved = self
                .provider
                .resolve_spec(&machine.spec.provider_spec)
                .await?;
            let token = self
                .provider
                .token
                .token(&self.provider.client, &resolved.auth)
                .await?;
            let url = format!("{}/v2.0/floatingips/{}", self.provider.network(), fip_id);
            self.provider.os_delete(&token, &url).await?;
            info!(machine = %machine.name, fip_id, "released floating IP");
        }

        store
            .update(&machine.namespace, &machine.name, &|m| {
                m.remove_annotation(FLOATING_IP_FINALIZER);
                m.finalizers.remove(FLOATING_IP_FINALIZER);
            })
            .await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
