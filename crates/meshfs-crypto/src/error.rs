//! Error types for session cryptography.

use thiserror::Error;

/// Errors that can occur during session crypto operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The content-key MAC did not verify. Fatal for the connection.
    #[error("content key MAC mismatch")]
    MacMismatch,

    /// AEAD sealing failed.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// AEAD opening failed (tampered, reordered or wrong key).
    #[error("decryption failed: message authentication error")]
    DecryptionError,

    /// Key material had the wrong length or layout.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// RSA operation or key encoding failed.
    #[error("rsa error: {0}")]
    Rsa(String),

    /// Base64 decoding failed.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Reading or writing a key file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
