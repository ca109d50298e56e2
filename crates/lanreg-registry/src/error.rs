//! Error types for the registry

use crate::wire::WireError;
use lanreg_codec::CodecError;
use lanreg_core::ConfigError;
use thiserror::Error;

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while running the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Operation requires a started registry
    #[error("Registry has not been started")]
    NotStarted,

    /// Transport is already running
    #[error("Registry is already running")]
    AlreadyStarted,

    /// No instances of the service are known
    #[error("Service not found: {0}")]
    NotFound(String),

    /// Record could not be encoded or reassembled
    #[error("Codec error: {0}")]
    Codec(CodecError),

    /// Record exceeds the configured maximum size
    #[error("Record of {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// The watcher was stopped
    #[error("Watcher has been stopped")]
    WatcherStopped,

    /// The watcher's queue overflowed and events were dropped; resync with
    /// `list_services`
    #[error("Watcher queue overflowed, {dropped} events dropped")]
    WatcherOverflow { dropped: u64 },

    /// The service cannot be registered as given
    #[error("Invalid service: {0}")]
    InvalidService(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Socket bind/send/receive failure
    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// A discovery message could not be built or parsed
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// No constructor registered under this backend name
    #[error("Unknown registry backend: {0}")]
    UnknownBackend(String),

    /// A constructor is already registered under this backend name
    #[error("Registry backend already registered: {0}")]
    BackendExists(String),

    /// Internal error
    #[error("Internal registry error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Wraps an I/O error with the operation that failed.
    pub fn transport(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            source,
        }
    }
}

impl From<CodecError> for RegistryError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::TooLarge { size, max } => RegistryError::TooLarge { size, max },
            other => RegistryError::Codec(other),
        }
    }
}
