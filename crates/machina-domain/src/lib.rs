pub mod error;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{validate_machine_name, DomainError};
pub use types::{
    spec_fingerprint, AddressRole, ErrorReason, FinalizerSet, Instance, InstanceStatus, Machine,
    MachinePhase, MachineSpec, MachineStatus, MachineVersions, OperatingSystem, ProviderKind,
    RawSpec, Uid,
};
