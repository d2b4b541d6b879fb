use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Sentinel: the machine does not exist. Callers match on this.
    #[error("machine not found: {namespace}/{name}")]
    NotFound { namespace: String, name: String },

    #[error("machine already exists: {namespace}/{name}")]
    AlreadyExists { namespace: String, name: String },

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
