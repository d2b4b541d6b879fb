use serde::{Deserialize, Serialize};

/// Raw YAML representation of one machine manifest entry. The one-shot CLI
/// reads a file containing a sequence of these.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawMachine {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub provider: String,
    #[serde(rename = "operatingSystem")]
    pub operating_system: String,
    /// Opaque provider-specific bag; handed to the provider unparsed.
    #[serde(rename = "providerSpec", default)]
    pub provider_spec: serde_yaml::Value,
    /// Kubelet version hint passed through to the consumer.
    #[serde(rename = "kubeletVersion")]
    pub kubelet_version: Option<String>,
    /// Pre-rendered boot userdata. One-shot mode has no renderer; manifests
    /// ship the finished text.
    #[serde(default)]
    pub userdata: String,
    /// SSH user emitted into machines.json for this machine.
    #[serde(rename = "sshUser")]
    pub ssh_user: Option<String>,
    /// Marks the machine as a bastion host in machines.json.
    #[serde(default)]
    pub bastion: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}
