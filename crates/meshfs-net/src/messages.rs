//! Wire message types.
//!
//! Every frame payload is one tag byte followed by the CBOR body of the
//! message. Tags are stable; bodies are plain serde records.

use serde::{Deserialize, Serialize};

use meshfs_core::{Conflict, DirEntry, FileKind, KeyFingerprint, PeerId, VersionVector};
use meshfs_crypto::DhPublic;

use crate::error::{NetError, Result};

/// Priority level for control traffic.
pub const PRIORITY_CONTROL: usize = 0;
/// Priority level for bulk file data.
pub const PRIORITY_BULK: usize = 1;
/// Number of outbound priority levels.
pub const PRIORITY_LEVELS: usize = 2;

macro_rules! messages {
    ($( $tag:literal => $name:ident, )*) => {
        /// Message type tag (payload byte 0).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageKind {
            $( $name = $tag, )*
        }

        impl MessageKind {
            /// Parse a tag byte.
            pub fn from_tag(tag: u8) -> Option<Self> {
                match tag {
                    $( $tag => Some(MessageKind::$name), )*
                    _ => None,
                }
            }

            /// The tag byte.
            pub const fn tag(self) -> u8 {
                self as u8
            }
        }

        /// A typed protocol message.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $( $name($name), )*
        }

        impl Message {
            /// The type tag of this message.
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( Message::$name(_) => MessageKind::$name, )*
                }
            }

            fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
                match self {
                    $( Message::$name(body) => ciborium::into_writer(body, out), )*
                }
                .map_err(|e| NetError::Encode(e.to_string()))
            }

            fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Self> {
                let err = |e: ciborium::de::Error<std::io::Error>| NetError::Decode {
                    kind,
                    reason: e.to_string(),
                };
                Ok(match kind {
                    $( MessageKind::$name => Message::$name(ciborium::from_reader(body).map_err(err)?), )*
                })
            }
        }

        $(
            impl From<$name> for Message {
                fn from(body: $name) -> Self {
                    Message::$name(body)
                }
            }
        )*
    };
}

messages! {
    1 => LeaderElect,
    2 => KeyExchange,
    3 => ContentKey,
    4 => AuthRequest,
    5 => AuthChallenge,
    6 => AuthSolution,
    7 => AuthResult,
    8 => IdMap,
    9 => DirChunk,
    10 => NodeInfo,
    11 => RequestChunk,
    12 => FileChunk,
    13 => TransferAbort,
    14 => RequestTree,
    15 => Ping,
    16 => Pong,
    17 => SetDisplayName,
    18 => SetDataDir,
    19 => AttemptConnection,
    20 => GetBackendInfo,
    21 => BackendInfo,
    22 => StartSync,
    23 => ListPeers,
    24 => PeerList,
    25 => ListConflicts,
    26 => ConflictList,
    27 => Subscribe,
    28 => UserInterfaceReply,
}

impl MessageKind {
    /// Part of the connection handshake.
    pub fn is_handshake(self) -> bool {
        (MessageKind::LeaderElect.tag()..=MessageKind::AuthResult.tag()).contains(&self.tag())
    }

    /// Sent by a local UI/CLI connection.
    pub fn is_control(self) -> bool {
        self.tag() >= MessageKind::SetDisplayName.tag()
    }
}

impl Message {
    /// Serialize to a frame payload: tag byte followed by the body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![self.kind().tag()];
        self.encode_body(&mut out)?;
        Ok(out)
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (&tag, body) = payload.split_first().ok_or(NetError::EmptyFrame)?;
        let kind = MessageKind::from_tag(tag).ok_or(NetError::UnknownMessageType(tag))?;
        Self::decode_body(kind, body)
    }

    /// Outbound priority level. Only file data is bulk.
    pub fn priority(&self) -> usize {
        match self {
            Message::FileChunk(_) => PRIORITY_BULK,
            _ => PRIORITY_CONTROL,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

/// One round of leader election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderElect {
    pub value: u64,
}

/// Public Diffie-Hellman components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub public: DhPublic,
}

/// Wrapped content key and IV followed by the truncated MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentKey {
    pub payload: Vec<u8>,
}

/// Identity announcement. Local connections send an empty key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Base64 DER public key.
    pub public_key: String,
    pub display_name: String,
}

/// A random challenge encrypted to the receiver's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub ciphertext: Vec<u8>,
}

/// The decrypted challenge, echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSolution {
    pub plaintext: Vec<u8>,
}

/// Verdict on the peer's solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub ok: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Replication
// ─────────────────────────────────────────────────────────────────────────────

/// One row of the sender's known-peers table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapEntry {
    /// The sender's id for this peer.
    pub id: PeerId,
    pub fingerprint: KeyFingerprint,
    pub display_name: String,
}

/// The sender's known-peers table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub peers: Vec<IdMapEntry>,
}

/// Snapshot of a directory's live children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirChunk {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

/// File stat plus version vector (in the sender's numbering).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub version: VersionVector,
    pub deleted: bool,
}

/// Ask for the bytes of `path` starting at `offset`.
///
/// `version` is the announced version being fetched, in the serving peer's
/// numbering; the server refuses once its copy has moved past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChunk {
    pub path: String,
    pub txn: u64,
    pub offset: u64,
    pub version: VersionVector,
}

/// A slice of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub path: String,
    pub txn: u64,
    pub offset: u64,
    pub total_size: u64,
    pub data: Vec<u8>,
}

/// The server cannot serve a requested transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAbort {
    pub path: String,
    pub txn: u64,
    pub reason: String,
}

/// Ask the peer to announce everything under `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTree {
    pub path: String,
}

/// Keepalive request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
}

/// Keepalive answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Local control
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDisplayName {
    pub name: String,
}

/// Takes effect on the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDataDir {
    pub path: String,
}

/// Dial a peer at `addr` (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptConnection {
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBackendInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub display_name: String,
    /// Hex fingerprint of this node's public key.
    pub fingerprint: String,
    pub listen_addr: String,
    pub data_dir: String,
    pub active_connections: u32,
    pub max_peers: u32,
}

/// Ask every connected peer for its tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPeers;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub fingerprint: String,
    pub display_name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConflicts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictList {
    pub conflicts: Vec<Conflict>,
}

/// Change whether `path` is replicated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub path: String,
    pub on: bool,
}

/// Generic answer to a control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInterfaceReply {
    pub ok: bool,
    pub msg: String,
}

impl UserInterfaceReply {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            ok: true,
            msg: msg.into(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            msg: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(MessageKind::LeaderElect.tag(), 1);
        assert_eq!(MessageKind::NodeInfo.tag(), 10);
        assert_eq!(MessageKind::UserInterfaceReply.tag(), 28);
        assert_eq!(MessageKind::from_tag(12), Some(MessageKind::FileChunk));
        assert_eq!(MessageKind::from_tag(0), None);
        assert_eq!(MessageKind::from_tag(200), None);
    }

    #[test]
    fn test_kind_classes() {
        assert!(MessageKind::AuthResult.is_handshake());
        assert!(!MessageKind::IdMap.is_handshake());
        assert!(MessageKind::Subscribe.is_control());
        assert!(!MessageKind::Pong.is_control());
    }

    #[test]
    fn test_payload_starts_with_tag() {
        let msg = Message::from(Ping { nonce: 7 });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], MessageKind::Ping.tag());
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unit_bodies() {
        for msg in [
            Message::from(GetBackendInfo),
            Message::from(StartSync),
            Message::from(ListPeers),
            Message::from(ListConflicts),
        ] {
            assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode(&[]), Err(NetError::EmptyFrame)));
        assert!(matches!(
            Message::decode(&[99, 0]),
            Err(NetError::UnknownMessageType(99))
        ));
        assert!(matches!(
            Message::decode(&[MessageKind::NodeInfo.tag(), 0xff, 0x00]),
            Err(NetError::Decode { kind: MessageKind::NodeInfo, .. })
        ));
    }

    #[test]
    fn test_priority() {
        let chunk = Message::from(FileChunk {
            path: "/a".into(),
            txn: 1,
            offset: 0,
            total_size: 0,
            data: vec![],
        });
        assert_eq!(chunk.priority(), PRIORITY_BULK);
        assert_eq!(Message::from(Ping { nonce: 0 }).priority(), PRIORITY_CONTROL);
    }
}
