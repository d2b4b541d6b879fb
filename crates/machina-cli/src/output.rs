use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use machina_domain::{AddressRole, Machine};
use serde::Serialize;

/// One entry in machines.json. Empty fields are omitted entirely.
#[derive(Debug, Serialize)]
pub struct MachineRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub bastion: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

#[derive(Debug, Serialize)]
struct MachinesFile {
    machines: Vec<MachineRecord>,
}

/// Build a record from a converged machine's surfaced addresses.
pub fn record_from(machine: &Machine, ssh_user: Option<String>, bastion: bool) -> MachineRecord {
    let address_of = |role: AddressRole| {
        machine
            .status
            .addresses
            .iter()
            .find(|(_, r)| **r == role)
            .map(|(addr, _)| addr.clone())
    };
    MachineRecord {
        public_address: address_of(AddressRole::ExternalIp),
        private_address: address_of(AddressRole::InternalIp),
        hostname: address_of(AddressRole::Hostname),
        ssh_user,
        bastion,
    }
}

/// Write machines.json with owner-only permissions — the records can carry
/// addresses and users an attacker would want.
pub fn write_machines_json(path: &Path, records: Vec<MachineRecord>) -> io::Result<()> {
    let file = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)?
        }
        #[cfg(not(unix))]
        {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?
        }
    };
    serde_json::to_writer_pretty(file, &MachinesFile { machines: records })
        .map_err(io::Error::other)
}
