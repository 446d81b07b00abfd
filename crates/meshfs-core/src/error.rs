//! Error types for meshfs core primitives.

use thiserror::Error;

use crate::types::PeerId;

/// Errors raised while building or interpreting core records.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("unknown file kind tag: {0}")]
    UnknownFileKind(u8),

    #[error("peer id {0} has no local translation")]
    UntranslatedPeer(PeerId),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
