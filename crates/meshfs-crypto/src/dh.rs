//! X25519 key agreement for the session handshake.
//!
//! Each side holds a static and an ephemeral keypair. Both shared secrets are
//! fed through a blake3 key derivation whose 64-byte output is split into the
//! key-encryption key (left half) and the MAC key (right half).

use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

const SESSION_CONTEXT: &str = "meshfs 2024 session kek+mac v0";

/// An X25519 public key (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(pk: PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

/// The public half of a [`DhKeyPair`], as sent in `KeyExchange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhPublic {
    pub static_key: X25519PublicKey,
    pub ephemeral_key: X25519PublicKey,
}

fn random_secret() -> StaticSecret {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    StaticSecret::from(bytes)
}

/// Static + ephemeral X25519 keypairs for one handshake.
///
/// Generated ahead of time by the connection pool and consumed by
/// [`DhKeyPair::agree`], so a keypair is never used for two sessions.
pub struct DhKeyPair {
    static_secret: StaticSecret,
    ephemeral_secret: StaticSecret,
    public: DhPublic,
}

impl DhKeyPair {
    /// Generate fresh keypairs.
    pub fn generate() -> Self {
        let static_secret = random_secret();
        let ephemeral_secret = random_secret();
        let public = DhPublic {
            static_key: PublicKey::from(&static_secret).into(),
            ephemeral_key: PublicKey::from(&ephemeral_secret).into(),
        };
        Self {
            static_secret,
            ephemeral_secret,
            public,
        }
    }

    /// The public components to send to the peer.
    pub fn public(&self) -> DhPublic {
        self.public
    }

    /// Compute the session keys from the peer's public components.
    pub fn agree(self, peer: &DhPublic) -> SessionKeys {
        let ee = self
            .ephemeral_secret
            .diffie_hellman(&peer.ephemeral_key.to_dalek());
        let ss = self.static_secret.diffie_hellman(&peer.static_key.to_dalek());
        SessionKeys::derive(ee.as_bytes(), ss.as_bytes())
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Keys derived from the DH shared secrets.
#[derive(Clone)]
pub struct SessionKeys {
    kek: [u8; 32],
    mac_key: [u8; 32],
}

impl SessionKeys {
    fn derive(ee: &[u8; 32], ss: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(SESSION_CONTEXT);
        hasher.update(ee);
        hasher.update(ss);
        let mut okm = [0u8; 64];
        hasher.finalize_xof().fill(&mut okm);

        let mut kek = [0u8; 32];
        let mut mac_key = [0u8; 32];
        kek.copy_from_slice(&okm[..32]);
        mac_key.copy_from_slice(&okm[32..]);
        Self { kek, mac_key }
    }

    /// Key-encryption key used to wrap the content key.
    pub fn kek(&self) -> &[u8; 32] {
        &self.kek
    }

    /// Key for the content-key MAC.
    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }
}
