//! Content key distribution.
//!
//! The leader generates a random AES-128 content key and a 96-bit session IV,
//! wraps both under the KEK with AES-256 (one block each, no padding scheme
//! needed) and appends a truncated keyed-blake3 MAC over the wrapped bytes.
//! The follower checks the MAC in constant time before unwrapping.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::dh::SessionKeys;
use crate::error::{CryptoError, Result};

/// Content key length (AES-128).
pub const CEK_LEN: usize = 16;
/// Session IV length (GCM nonce).
pub const IV_LEN: usize = 12;
/// Truncated MAC length.
pub const MAC_LEN: usize = 16;
/// Wrapped key + IV: two AES blocks.
pub const WRAPPED_LEN: usize = 32;
/// Total size of a `ContentKey` payload.
pub const CONTENT_KEY_PAYLOAD_LEN: usize = WRAPPED_LEN + MAC_LEN;

/// The session content-encryption key and IV.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    cek: [u8; CEK_LEN],
    iv: [u8; IV_LEN],
}

impl ContentKey {
    /// Generate a new random content key and IV.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut cek = [0u8; CEK_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut cek);
        rng.fill_bytes(&mut iv);
        Self { cek, iv }
    }

    /// Create from raw parts.
    pub const fn from_parts(cek: [u8; CEK_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { cek, iv }
    }

    /// The AES-128 key.
    pub fn cek(&self) -> &[u8; CEK_LEN] {
        &self.cek
    }

    /// The session IV.
    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Wrap under the session KEK, producing `wrapped ‖ mac`.
    pub fn wrap(&self, keys: &SessionKeys) -> Vec<u8> {
        let cipher = Aes256::new(GenericArray::from_slice(keys.kek()));

        let mut key_block = GenericArray::clone_from_slice(&self.cek);
        let mut iv_block = GenericArray::clone_from_slice(&[0u8; 16]);
        iv_block[..IV_LEN].copy_from_slice(&self.iv);
        cipher.encrypt_block(&mut key_block);
        cipher.encrypt_block(&mut iv_block);

        let mut out = Vec::with_capacity(CONTENT_KEY_PAYLOAD_LEN);
        out.extend_from_slice(&key_block);
        out.extend_from_slice(&iv_block);
        let mac = compute_mac(keys.mac_key(), &out);
        out.extend_from_slice(&mac);
        out
    }

    /// Verify and unwrap a `wrapped ‖ mac` payload.
    ///
    /// A MAC mismatch means the payload was tampered with (or the two sides
    /// disagree on the KEK); the caller must drop the connection.
    pub fn unwrap_payload(payload: &[u8], keys: &SessionKeys) -> Result<Self> {
        if payload.len() != CONTENT_KEY_PAYLOAD_LEN {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "content key payload is {} bytes, expected {}",
                payload.len(),
                CONTENT_KEY_PAYLOAD_LEN
            )));
        }
        let (wrapped, mac) = payload.split_at(WRAPPED_LEN);
        let expected = compute_mac(keys.mac_key(), wrapped);
        if !bool::from(expected[..].ct_eq(mac)) {
            return Err(CryptoError::MacMismatch);
        }

        let cipher = Aes256::new(GenericArray::from_slice(keys.kek()));
        let mut key_block = GenericArray::clone_from_slice(&wrapped[..16]);
        let mut iv_block = GenericArray::clone_from_slice(&wrapped[16..]);
        cipher.decrypt_block(&mut key_block);
        cipher.decrypt_block(&mut iv_block);

        if iv_block[IV_LEN..].iter().any(|&b| b != 0) {
            return Err(CryptoError::InvalidKeyMaterial("IV block padding".into()));
        }

        let mut cek = [0u8; CEK_LEN];
        let mut iv = [0u8; IV_LEN];
        cek.copy_from_slice(&key_block);
        iv.copy_from_slice(&iv_block[..IV_LEN]);
        Ok(Self { cek, iv })
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

fn compute_mac(mac_key: &[u8; 32], data: &[u8]) -> [u8; MAC_LEN] {
    let full = blake3::keyed_hash(mac_key, data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full.as_bytes()[..MAC_LEN]);
    out
}
