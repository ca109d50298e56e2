//! Error types for the record codec

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised while encoding or reassembling a discovery record.
///
/// Decoding never yields a partially populated record: any of these errors
/// means the whole chunk set was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Nothing to decode
    #[error("no chunks to decode")]
    Empty,

    /// A chunk index between 0 and total was never received
    #[error("chunk {index} of {total} is missing")]
    MissingChunk { index: usize, total: usize },

    /// Chunks disagree on how many chunks make up the record
    #[error("chunk count mismatch: expected {expected}, found {found}")]
    InconsistentTotal { expected: usize, found: usize },

    /// The declared data length does not match the data carried
    #[error("chunk {index} declares {expected} data bytes but carries {actual}")]
    LengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    /// The chunk header or data is unreadable
    #[error("corrupt chunk: {0}")]
    CorruptChunk(String),

    /// The record exceeds the configured maximum size
    #[error("record of {size} bytes exceeds maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// The reassembled payload is not a valid record
    #[error("invalid record payload: {0}")]
    Malformed(String),
}

impl CodecError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptChunk(reason.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
