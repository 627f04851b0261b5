#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors raised by the certificate layer.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// The signing authority is required but could not be provisioned or
    /// loaded. Distinct from a transport failure.
    #[error("certificate authority unavailable: {0}")]
    CaUnavailable(String),

    /// A stored secret exists but does not hold usable TLS material.
    #[error("secret {namespace}/{name} is invalid: {reason}")]
    InvalidSecret {
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    #[error("invalid DNS name '{0}'")]
    InvalidDnsName(String),

    #[error("secret store error: {0}")]
    Store(#[from] StoreError),
}

impl PkiError {
    /// True when the failure came from the backing store rather than from
    /// the certificate material itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, PkiError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, PkiError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
