//! Common error types for CloudSave.

use thiserror::Error;

/// Top-level error type for CloudSave operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packing or unpacking a snapshot archive failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Provider is not authenticated or credentials were rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Transport to the remote storage failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote storage rejected the operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The provider registry no longer accepts registrations.
    #[error("The provider registry is locked; providers must be registered during startup")]
    RegistryLocked,

    /// A provider was registered with a blank name.
    #[error("Storage provider names cannot be empty")]
    EmptyProviderName,

    /// A provider name collided with an existing registration.
    #[error("Provider '{name}' was already registered by '{source_id}'")]
    DuplicateProvider { name: String, source_id: String },

    /// No provider is registered under the requested name.
    #[error(
        "Provider '{name}' was not registered. The available providers are: [{}]",
        .available.join(", ")
    )]
    UnknownProvider { name: String, available: Vec<String> },

    /// Backup interval must be a positive number of seconds.
    #[error("Invalid backup interval: {0} seconds (must be positive)")]
    InvalidInterval(i64),

    /// The serialized execution context no longer accepts work.
    #[error("The execution context has shut down")]
    ExecutorClosed,

    /// A job panicked on the execution context.
    #[error("A job panicked on the execution context")]
    JobPanicked,
}

impl Error {
    /// Whether the error reports a missing remote object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
