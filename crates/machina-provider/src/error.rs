use machina_domain::{ErrorReason, ProviderKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Sentinel returned by `get` when no backend resource is bound to the
    /// machine. Callers match on this to take the create path.
    #[error("instance not found")]
    InstanceNotFound,

    /// Unrecoverable configuration problem. The engine stops retrying and
    /// surfaces reason/message on the Machine status.
    #[error("{reason}: {message}")]
    Terminal { reason: ErrorReason, message: String },

    #[error("no provider registered for: {0}")]
    NotRegistered(ProviderKind),

    /// Upstream failed in a way that should heal on retry.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(#[from] machina_store::StoreError),
}

impl ProviderError {
    pub fn terminal(reason: ErrorReason, message: impl Into<String>) -> Self {
        ProviderError::Terminal {
            reason,
            message: message.into(),
        }
    }

    /// Terminal with reason `InvalidConfiguration` — the classification for
    /// every spec parse/resolution failure.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::terminal(ErrorReason::InvalidConfiguration, message)
    }

    /// True when retrying cannot help until the spec changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderError::Terminal { .. } | ProviderError::NotRegistered(_)
        )
    }

    pub fn reason(&self) -> Option<ErrorReason> {
        match self {
            ProviderError::Terminal { reason, .. } => Some(*reason),
            ProviderError::NotRegistered(_) => Some(ErrorReason::InvalidConfiguration),
            _ => None,
        }
    }
}

/// Map a backend HTTP response onto the taxonomy:
/// 401 is always a credential problem; a 403 carrying a quota marker means
/// the project is out of capacity; everything else is retryable.
pub fn classify_http(status: u16, body: &str) -> ProviderError {
    match status {
        401 => ProviderError::terminal(
            ErrorReason::Unauthorized,
            format!("backend rejected credentials: {}", truncate(body)),
        ),
        403 if body.to_ascii_lowercase().contains("quota exceeded") => ProviderError::terminal(
            ErrorReason::InsufficientResources,
            format!("quota exceeded: {}", truncate(body)),
        ),
        _ => ProviderError::Upstream(format!("HTTP {}: {}", status, truncate(body))),
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(240) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_terminal() {
        let err = classify_http(401, "invalid credentials");
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(ErrorReason::Unauthorized));
    }

    #[test]
    fn quota_marker_in_forbidden_body_is_insufficient_resources() {
        let err = classify_http(403, r#"{"forbidden": {"message": "Quota exceeded for instances"}}"#);
        assert!(err.is_terminal());
        assert_eq!(err.reason(), Some(ErrorReason::InsufficientResources));
    }

    #[test]
    fn plain_forbidden_is_retryable() {
        let err = classify_http(403, "forbidden");
        assert!(!err.is_terminal());
        assert!(err.reason().is_none());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(!classify_http(503, "try later").is_terminal());
        assert!(!classify_http(500, "boom").is_terminal());
    }

    #[test]
    fn invalid_config_carries_reason() {
        let err = ProviderError::invalid_config("flavor is required");
        assert_eq!(err.reason(), Some(ErrorReason::InvalidConfiguration));
    }
}
