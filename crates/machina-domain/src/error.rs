use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid machine name: {0}")]
    InvalidMachineName(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown operating system: {0}")]
    UnknownOperatingSystem(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Validate a machine name for use as a backend display name and DNS label:
/// lowercase alphanumerics and hyphens, starts and ends alphanumeric,
/// at most 63 chars.
pub fn validate_machine_name(name: &str) -> Result<(), DomainError> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(DomainError::InvalidMachineName(name.to_string()))
    }
}
