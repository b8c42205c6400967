use lodestar_types::TypeError;
use thiserror::Error;

/// Errors returned by registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The lease is missing, belongs to a different record, or has expired.
    #[error("unknown lease")]
    UnknownLease,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("recovery failed: {0}")]
    Recovery(String),
}

impl From<TypeError> for RegistryError {
    fn from(e: TypeError) -> Self {
        RegistryError::InvalidArgument(e.to_string())
    }
}

/// Errors from the log and snapshot files.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption in {file} at offset {offset}: {reason}")]
    Corruption {
        file: String,
        offset: u64,
        reason: String,
    },

    #[error("unsupported {file} format version {version}")]
    UnsupportedVersion { file: String, version: u16 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("log append suspended until the next snapshot")]
    NeedsSnapshot,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
