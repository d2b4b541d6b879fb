use std::path::Path;

use machina_domain::{
    validate_machine_name, Machine, MachineSpec, MachineStatus, MachineVersions,
};
use tracing::debug;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::raw::RawMachine;

/// A machine parsed from a manifest, plus the output-only fields that ride
/// along for machines.json.
#[derive(Debug, Clone)]
pub struct ParsedMachine {
    pub machine: Machine,
    pub userdata: String,
    pub ssh_user: Option<String>,
    pub bastion: bool,
}

/// Load a manifest file: a YAML sequence of machine entries.
///
/// One-shot mode has no store assigning identities, so each machine gets a
/// fresh UID at parse time. Two loads of the same file yield distinct UIDs;
/// within a single CLI run the UID is the stable correlation token.
pub fn load_machines(path: &Path) -> Result<Vec<ParsedMachine>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let raw: Vec<RawMachine> =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
            path: path.display().to_string(),
            source: e,
        })?;

    debug!(count = raw.len(), path = %path.display(), "loaded machine manifests");

    raw.into_iter()
        .map(|r| convert_machine(r, path))
        .collect()
}

fn convert_machine(raw: RawMachine, path: &Path) -> Result<ParsedMachine, ConfigError> {
    validate_machine_name(&raw.name)?;

    let provider = raw
        .provider
        .parse()
        .map_err(|e: machina_domain::DomainError| ConfigError::Conversion {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let operating_system = raw
        .operating_system
        .parse()
        .map_err(|e: machina_domain::DomainError| ConfigError::Conversion {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    // YAML → JSON for the opaque spec; YAML-only constructs (tags, non-string
    // keys) are a manifest error, not something providers should ever see.
    let provider_spec =
        serde_json::to_value(&raw.provider_spec).map_err(|e| ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("providerSpec for '{}' is not plain data: {}", raw.name, e),
        })?;

    let machine = Machine {
        name: raw.name,
        namespace: raw.namespace,
        uid: machina_domain::Uid::new(Uuid::new_v4().to_string()),
        spec: MachineSpec {
            provider,
            provider_spec,
            operating_system,
            versions: MachineVersions {
                kubelet: raw.kubelet_version,
            },
        },
        annotations: Default::default(),
        finalizers: Default::default(),
        deletion_timestamp: None,
        status: MachineStatus::default(),
        resource_version: 0,
    };

    Ok(ParsedMachine {
        machine,
        userdata: raw.userdata,
        ssh_user: raw.ssh_user,
        bastion: raw.bastion,
    })
}
