//! Long-lived RSA identity used for mutual authentication.
//!
//! Public keys travel as base64 of the SPKI DER encoding. Challenges are
//! encrypted with RSA-OAEP (SHA-256) so only the holder of the private key
//! can echo them back.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use meshfs_core::KeyFingerprint;

use crate::error::{CryptoError, Result};

/// Length of an authentication challenge.
pub const CHALLENGE_LEN: usize = 32;

fn rsa_err(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::Rsa(e.to_string())
}

/// A peer's RSA private key.
#[derive(Clone)]
pub struct RsaIdentity {
    private: RsaPrivateKey,
    public: PeerPublicKey,
}

impl RsaIdentity {
    /// Generate a new identity.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(rsa_err)?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public = PeerPublicKey::from_key(RsaPublicKey::from(&private))?;
        Ok(Self { private, public })
    }

    /// Parse a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).map_err(rsa_err)?;
        Self::from_private(private)
    }

    /// Encode as PKCS#8 PEM.
    pub fn to_pem(&self) -> Result<String> {
        let pem = self.private.to_pkcs8_pem(LineEnding::LF).map_err(rsa_err)?;
        Ok(pem.to_string())
    }

    /// Load the identity at `path`, generating and saving one if absent.
    pub fn load_or_generate(path: &Path, bits: usize) -> Result<Self> {
        if path.exists() {
            let pem = std::fs::read_to_string(path)?;
            return Self::from_pem(&pem);
        }
        let identity = Self::generate(bits)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.to_pem()?)?;
        tracing::info!(path = %path.display(), fingerprint = %identity.fingerprint(), "generated identity");
        Ok(identity)
    }

    /// The public half.
    pub fn public_key(&self) -> &PeerPublicKey {
        &self.public
    }

    /// Fingerprint of the public key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        self.public.fingerprint()
    }

    /// Decrypt a challenge addressed to this identity.
    pub fn decrypt_challenge(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(rsa_err)
    }
}

impl std::fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsaIdentity({})", self.fingerprint())
    }
}

/// A peer's RSA public key with its DER encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerPublicKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl PeerPublicKey {
    fn from_key(key: RsaPublicKey) -> Result<Self> {
        let der = key.to_public_key_der().map_err(rsa_err)?.as_bytes().to_vec();
        Ok(Self { key, der })
    }

    /// Parse from the base64 wire form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let der = BASE64.decode(encoded.trim())?;
        let key = RsaPublicKey::from_public_key_der(&der).map_err(rsa_err)?;
        Ok(Self { key, der })
    }

    /// Encode to the base64 wire form.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.der)
    }

    /// DER (SPKI) encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Blake3 fingerprint of the DER encoding.
    pub fn fingerprint(&self) -> KeyFingerprint {
        KeyFingerprint::of(&self.der)
    }

    /// Encrypt data (a challenge) to this key.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data)
            .map_err(rsa_err)
    }
}

impl std::fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerPublicKey({})", self.fingerprint())
    }
}

/// A fresh random authentication challenge.
pub fn random_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RsaIdentity {
        RsaIdentity::generate(1024).unwrap()
    }

    #[test]
    fn test_challenge_roundtrip() {
        let id = identity();
        let challenge = random_challenge();
        let sealed = id.public_key().encrypt(&challenge).unwrap();
        assert_eq!(id.decrypt_challenge(&sealed).unwrap(), challenge);
    }

    #[test]
    fn test_other_key_cannot_answer() {
        let alice = identity();
        let mallory = identity();
        let sealed = alice.public_key().encrypt(&random_challenge()).unwrap();
        assert!(mallory.decrypt_challenge(&sealed).is_err());
    }

    #[test]
    fn test_public_key_base64() {
        let id = identity();
        let wire = id.public_key().to_base64();
        let parsed = PeerPublicKey::from_base64(&wire).unwrap();
        assert_eq!(&parsed, id.public_key());
        assert_eq!(parsed.fingerprint(), id.fingerprint());
        assert!(PeerPublicKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.pem");

        let first = RsaIdentity::load_or_generate(&path, 1024).unwrap();
        let second = RsaIdentity::load_or_generate(&path, 1024).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }
}
