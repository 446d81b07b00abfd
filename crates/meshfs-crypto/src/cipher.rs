//! AES-GCM framing cipher, one instance per direction.
//!
//! The GCM state is rebuilt from the session key for every message, so no
//! cipher state survives between operations. The nonce for message `n` is
//! the session IV with the direction bit and `n` XORed in; `n` advances only
//! after an operation succeeds. Both sides therefore walk the same nonce
//! sequence and no (key, nonce) pair is ever used twice.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};

use crate::error::{CryptoError, Result};
use crate::keywrap::{ContentKey, IV_LEN};

/// Bytes added to every sealed message.
pub const TAG_LEN: usize = 16;

/// Which way a cipher's traffic flows, relative to the handshake leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Leader to follower.
    FromLeader,
    /// Follower to leader.
    FromFollower,
}

impl Direction {
    /// The (send, receive) directions for one side of a session.
    pub fn pair(is_leader: bool) -> (Direction, Direction) {
        if is_leader {
            (Direction::FromLeader, Direction::FromFollower)
        } else {
            (Direction::FromFollower, Direction::FromLeader)
        }
    }

    fn bit(self) -> u8 {
        match self {
            Direction::FromLeader => 0x00,
            Direction::FromFollower => 0x80,
        }
    }
}

/// Seals or opens messages flowing in one direction.
pub struct DirectionalCipher {
    key: ContentKey,
    direction: Direction,
    counter: u64,
}

impl DirectionalCipher {
    /// Start a cipher at message counter zero.
    pub fn new(key: ContentKey, direction: Direction) -> Self {
        Self {
            key,
            direction,
            counter: 0,
        }
    }

    /// Number of messages processed so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn nonce(&self) -> [u8; IV_LEN] {
        let mut nonce = *self.key.iv();
        nonce[0] ^= self.direction.bit();
        for (slot, byte) in nonce[IV_LEN - 8..]
            .iter_mut()
            .zip(self.counter.to_be_bytes())
        {
            *slot ^= byte;
        }
        nonce
    }

    fn cipher(&self) -> Result<Aes128Gcm> {
        Aes128Gcm::new_from_slice(self.key.cek())
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))
    }

    /// Seal one message.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce();
        let sealed = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        self.counter += 1;
        Ok(sealed)
    }

    /// Open one message. Any tampering fails authentication.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce();
        let plain = self
            .cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionError)?;
        self.counter += 1;
        Ok(plain)
    }
}

impl std::fmt::Debug for DirectionalCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionalCipher")
            .field("direction", &self.direction)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}
