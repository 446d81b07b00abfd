//! # meshfs Crypto
//!
//! Primitives behind the peer handshake and the encrypted session.
//!
//! ## Overview
//!
//! A remote connection is secured in three layers:
//!
//! 1. **Key agreement**: both sides exchange static and ephemeral X25519
//!    keys ([`DhKeyPair`]) and derive a key-encryption key and a MAC key
//!    ([`SessionKeys`]).
//! 2. **Content key**: the elected leader generates a [`ContentKey`] and
//!    sends it wrapped under the KEK with a MAC. A bad MAC is fatal.
//! 3. **Session cipher**: every frame after the handshake is AES-GCM sealed
//!    by a [`DirectionalCipher`], one per direction.
//!
//! Peers prove who they are with an [`RsaIdentity`]: each side encrypts a
//! random challenge to the other's public key and expects it echoed back.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshfs_crypto::{ContentKey, DhKeyPair, Direction, DirectionalCipher};
//!
//! let ours = DhKeyPair::generate();
//! let theirs = DhKeyPair::generate();
//! let their_public = theirs.public();
//! let keys = ours.agree(&their_public);
//!
//! let cek = ContentKey::generate();
//! let payload = cek.wrap(&keys);
//! let received = ContentKey::unwrap_payload(&payload, &keys).unwrap();
//!
//! let (send, _recv) = Direction::pair(true);
//! let mut cipher = DirectionalCipher::new(received, send);
//! let sealed = cipher.seal(b"hello").unwrap();
//! ```

pub mod cipher;
pub mod dh;
pub mod error;
pub mod identity;
pub mod keywrap;

pub use cipher::{Direction, DirectionalCipher, TAG_LEN};
pub use dh::{DhKeyPair, DhPublic, SessionKeys, X25519PublicKey};
pub use error::{CryptoError, Result};
pub use identity::{random_challenge, PeerPublicKey, RsaIdentity, CHALLENGE_LEN};
pub use keywrap::{ContentKey, CONTENT_KEY_PAYLOAD_LEN};

use rand::RngCore;

/// A random value for one round of leader election.
pub fn election_value() -> u64 {
    rand::thread_rng().next_u64()
}
