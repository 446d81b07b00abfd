//! Error types for the connection layer.

use thiserror::Error;

use crate::messages::MessageKind;

/// Errors that can occur on a peer connection.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("peer disconnected")]
    Disconnected,

    /// The terminate signal fired.
    #[error("cancelled")]
    Cancelled,

    /// A frame exceeded the configured ceiling.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// A frame carried no tag byte.
    #[error("empty frame")]
    EmptyFrame,

    /// A frame carried a tag we do not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Message body could not be encoded.
    #[error("encoding error: {0}")]
    Encode(String),

    /// Message body could not be decoded.
    #[error("decoding error ({kind:?}): {reason}")]
    Decode { kind: MessageKind, reason: String },

    /// A message arrived out of protocol order.
    #[error("unexpected message: expected {expected}, got {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: MessageKind,
    },

    /// A well-formed message violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Leader election kept tying.
    #[error("leader election tied {0} times")]
    ElectionExhausted(usize),

    /// The peer failed (or refused) authentication.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The handshake did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Session crypto failed (MAC mismatch, bad tag, bad key).
    #[error("crypto error: {0}")]
    Crypto(#[from] meshfs_crypto::CryptoError),

    /// Metadata store failed.
    #[error("store error: {0}")]
    Store(#[from] meshfs_store::StoreError),

    /// Core type conversion failed.
    #[error("core error: {0}")]
    Core(#[from] meshfs_core::CoreError),

    /// The connection's outbound queue is full at this priority.
    #[error("outbound queue full")]
    QueueFull,

    /// Every pooled connection slot is in use.
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl NetError {
    /// Whether this is an ordinary end of the connection rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetError::Disconnected | NetError::Cancelled => true,
            NetError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::WriteZero
            ),
            _ => false,
        }
    }
}

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(NetError::Disconnected.is_disconnect());
        assert!(NetError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .is_disconnect());
        assert!(!NetError::FrameTooLarge { len: 9, max: 1 }.is_disconnect());
        assert!(!NetError::Crypto(meshfs_crypto::CryptoError::MacMismatch).is_disconnect());
    }
}
