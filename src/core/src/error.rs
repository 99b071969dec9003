use thiserror::Error;

/// Classified errors for every layer of the shim.
///
/// The manager client classifies wire failures into this taxonomy; the CRI
/// surface maps each variant onto a gRPC status code. Idempotence decisions
/// (a stop of an already-stopped container, a delete of a missing one) are
/// made by looking at the variant, never by string matching at call sites.
#[derive(Error, Debug)]
pub enum ShimError {
    /// The target container, image, or operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target is already in the requested state.
    #[error("already in target state: {0}")]
    AlreadyInState(String),

    /// A transient failure on the management channel; eligible for retry.
    #[error("transient manager error: {0}")]
    Transient(String),

    /// The request was rejected by validation; never retried.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Optimistic-concurrency conflict on a metadata write (ETag mismatch).
    #[error("conflict: {0}")]
    Conflict(String),

    /// CNI attach failed or produced an unusable result.
    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    /// A deadline expired while waiting on the manager.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Permission, quota, or manager-side failure; surfaced unchanged.
    #[error("manager error: {0}")]
    Fatal(String),

    /// Configuration error at startup or in a request option.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error talking to sockets or the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ShimError {
    /// Whether a retry of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ShimError::Transient(_) | ShimError::Timeout(_))
    }

    /// Whether the target was absent, which idempotent operations treat
    /// as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShimError::NotFound(_))
    }
}

impl From<serde_json::Error> for ShimError {
    fn from(err: serde_json::Error) -> Self {
        ShimError::Serialization(err.to_string())
    }
}

/// Result type alias for shim operations.
pub type Result<T> = std::result::Result<T, ShimError>;
