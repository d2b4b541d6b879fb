use machina_domain::ErrorReason;
use machina_provider::ProviderError;
use machina_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("userdata rendering failed: {0}")]
    Userdata(String),
}

impl EngineError {
    /// True when retrying cannot help until the spec changes.
    pub fn is_terminal(&self) -> bool {
        match self {
            EngineError::Provider(e) => e.is_terminal(),
            EngineError::Store(_) => false,
            // A machine whose userdata cannot render is misconfigured.
            EngineError::Userdata(_) => true,
        }
    }

    /// Reason/message pair surfaced on the machine status for terminal errors.
    pub fn status_reason(&self) -> (ErrorReason, String) {
        match self {
            EngineError::Provider(e) => (
                e.reason().unwrap_or(ErrorReason::Unknown),
                e.to_string(),
            ),
            EngineError::Store(e) => (ErrorReason::Unknown, e.to_string()),
            EngineError::Userdata(msg) => (ErrorReason::InvalidConfiguration, msg.clone()),
        }
    }
}
