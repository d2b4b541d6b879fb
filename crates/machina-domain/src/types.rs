use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque provider spec — any JSON value. Parsed only by the provider that
/// owns it; the engine treats it as a bag of bytes with a fingerprint.
pub type RawSpec = serde_json::Value;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Opaque stable identity assigned by the store on create. The correlation
/// token between the declarative layer and backend metadata; may be rewritten
/// out of band, in which case providers relabel via `migrate_uid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(s: impl Into<String>) -> Self {
        Uid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Enums ─────────────────────────────────────────────────────────────────────

/// The closed set of backends a Machine can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openstack,
    Kubevirt,
    Baremetal,
    Fake,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Openstack => write!(f, "openstack"),
            ProviderKind::Kubevirt => write!(f, "kubevirt"),
            ProviderKind::Baremetal => write!(f, "baremetal"),
            ProviderKind::Fake => write!(f, "fake"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openstack" => Ok(ProviderKind::Openstack),
            "kubevirt" => Ok(ProviderKind::Kubevirt),
            "baremetal" => Ok(ProviderKind::Baremetal),
            "fake" => Ok(ProviderKind::Fake),
            other => Err(crate::error::DomainError::UnknownProvider(other.to_string())),
        }
    }
}

/// Operating system the instance boots. Providers reject combinations they
/// cannot render userdata for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    Ubuntu,
    Flatcar,
    #[serde(rename = "rockylinux")]
    RockyLinux,
    Rhel,
    Amzn2,
}

impl std::fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingSystem::Ubuntu => write!(f, "ubuntu"),
            OperatingSystem::Flatcar => write!(f, "flatcar"),
            OperatingSystem::RockyLinux => write!(f, "rockylinux"),
            OperatingSystem::Rhel => write!(f, "rhel"),
            OperatingSystem::Amzn2 => write!(f, "amzn2"),
        }
    }
}

impl std::str::FromStr for OperatingSystem {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ubuntu" => Ok(OperatingSystem::Ubuntu),
            "flatcar" => Ok(OperatingSystem::Flatcar),
            "rockylinux" => Ok(OperatingSystem::RockyLinux),
            "rhel" => Ok(OperatingSystem::Rhel),
            "amzn2" => Ok(OperatingSystem::Amzn2),
            other => Err(crate::error::DomainError::UnknownOperatingSystem(
                other.to_string(),
            )),
        }
    }
}

/// The lifecycle phase of a Machine.
///
/// Transitions:
///   Pending → Provisioning → Running
///   Running → Provisioning (instance vanished, re-create)
///   any → Deleting (deletion timestamp set)
///   any → Failed (terminal error; exits only on spec edit or delete)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MachinePhase {
    /// Known but never reconciled.
    #[default]
    Pending,
    /// Backend create issued, awaiting readiness.
    Provisioning,
    /// Backend confirms the instance is active and addressed.
    Running,
    /// Deletion timestamp set; only cleanup and finalizers run.
    Deleting,
    /// Terminal error observed; reason/message are populated.
    Failed,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachinePhase::Pending => "pending",
            MachinePhase::Provisioning => "provisioning",
            MachinePhase::Running => "running",
            MachinePhase::Deleting => "deleting",
            MachinePhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Machine-readable reason attached to a terminal error. Closed set; the
/// surrounding loop stops retrying when one of these is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    InvalidConfiguration,
    Unauthorized,
    InsufficientResources,
    CreateMachineError,
    DeleteMachineError,
    Unknown,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorReason::InvalidConfiguration => "InvalidConfiguration",
            ErrorReason::Unauthorized => "Unauthorized",
            ErrorReason::InsufficientResources => "InsufficientResources",
            ErrorReason::CreateMachineError => "CreateMachineError",
            ErrorReason::DeleteMachineError => "DeleteMachineError",
            ErrorReason::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

// ── Instance (provider-side view) ─────────────────────────────────────────────

/// What an address is good for, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressRole {
    #[serde(rename = "InternalIP")]
    InternalIp,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    Hostname,
    #[serde(rename = "InternalDNS")]
    InternalDns,
}

/// Backend-reported lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Deleting,
    Unknown,
}

/// The backend resource as observed through a provider. Instantiated
/// transiently per reconcile; the engine never persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider-side opaque id.
    pub id: String,
    /// Display name on the backend.
    pub name: String,
    pub status: InstanceStatus,
    /// address → role. A Running instance has at least one entry.
    pub addresses: HashMap<String, AddressRole>,
    /// Scheme-prefixed URI, e.g. `openstack:///<uuid>`.
    pub provider_uri: String,
}

impl Instance {
    /// First address carrying the given role, if any.
    pub fn address_of(&self, role: AddressRole) -> Option<&str> {
        self.addresses
            .iter()
            .find(|(_, r)| **r == role)
            .map(|(addr, _)| addr.as_str())
    }
}

// ── Finalizers ────────────────────────────────────────────────────────────────

/// Ordered, duplicate-free list of named cleanup hooks. Hooks run in
/// declaration order after the backend resource is gone; the Machine is not
/// considered deleted until the set is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FinalizerSet(Vec<String>);

impl FinalizerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `name` unless already present. Returns true if it was added.
    pub fn add(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.0.contains(&name) {
            return false;
        }
        self.0.push(name);
        true
    }

    /// Remove `name`. Returns true if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|f| f != name);
        self.0.len() != before
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|f| f == name)
    }

    /// Declaration order.
    pub fn list(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Machine ───────────────────────────────────────────────────────────────────

/// Version hints passed through to the kubelet-layer consumer. Opaque to the
/// engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MachineVersions {
    pub kubelet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub provider: ProviderKind,
    /// Provider-specific bag; parsed only by the matching provider.
    pub provider_spec: RawSpec,
    pub operating_system: OperatingSystem,
    #[serde(default)]
    pub versions: MachineVersions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MachineStatus {
    pub phase: MachinePhase,
    /// Provider-side id of the bound instance. Reconstructible from spec +
    /// name + uid; losing it is never fatal.
    pub instance_id: Option<String>,
    pub provider_uri: Option<String>,
    #[serde(default)]
    pub addresses: HashMap<String, AddressRole>,
    pub error_reason: Option<ErrorReason>,
    pub error_message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// The declarative object. Owned by the external store; the controller reads
/// it and writes status/annotations/finalizers through the updater interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    pub namespace: String,
    pub uid: Uid,
    pub spec: MachineSpec,
    /// Free-form map; carries out-of-band external IDs (e.g. an allocated
    /// floating-IP id) under keys identical to the matching finalizer name.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub finalizers: FinalizerSet,
    /// Set once deletion begins. While set, Create is illegal.
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MachineStatus,
    /// Store revision, bumped on every write. Backs optimistic concurrency.
    #[serde(default)]
    pub resource_version: u64,
}

impl Machine {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        self.annotations.remove(key)
    }
}

// ── Spec fingerprinting ───────────────────────────────────────────────────────

/// Serialize `spec` to canonical JSON (object keys sorted) and return its
/// SHA-256 hex digest. Two specs that hash equally are interchangeable inputs
/// to provider validation, so the digest doubles as the validation-cache key.
pub fn spec_fingerprint(spec: &RawSpec) -> String {
    let canonical = sort_json_keys(spec.clone());
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

/// Recursively sort JSON object keys so map field ordering doesn't affect
/// the hash.
pub(crate) fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_json_keys(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}
