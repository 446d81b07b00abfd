//! Connection handshake state machine.
//!
//! Remote connections run, strictly in order:
//!
//! ```text
//! LeaderElect   <->   (repeat on tie, bounded)
//! KeyExchange   <->   static + ephemeral X25519 publics
//! ContentKey     ->   leader only; follower verifies the MAC
//!               ==    both directions now AES-GCM sealed
//! AuthRequest   <->   RSA public key + display name
//! AuthChallenge <->   random bytes encrypted to the peer's key
//! AuthSolution  <->   decrypted bytes echoed back
//! AuthResult    <->   verdict
//! ```
//!
//! Local (UI/CLI) connections skip everything but the AuthRequest exchange
//! and are trusted. Any out-of-order message, bad MAC or failed challenge is
//! fatal for the attempt.

use tokio::io::{AsyncRead, AsyncWrite};

use meshfs_core::KeyFingerprint;
use meshfs_crypto::{
    election_value, random_challenge, ContentKey, DhKeyPair, Direction, DirectionalCipher,
    PeerPublicKey, RsaIdentity,
};
use subtle::ConstantTimeEq;

use crate::error::{NetError, Result};
use crate::marshall::{FrameReader, FrameWriter};
use crate::messages::{self as msg, Message};

/// Maximum leader-election rounds before giving up.
pub const MAX_ELECTION_ROUNDS: usize = 8;

/// Display name local connections announce.
pub const LOCAL_MARKER: &str = "local";

/// Who is on the other end of a finished handshake.
#[derive(Debug, Clone)]
pub enum RemoteIdentity {
    /// A trusted local UI/CLI client.
    Local { display_name: String },
    /// An authenticated peer.
    Peer {
        public_key: PeerPublicKey,
        display_name: String,
    },
}

impl RemoteIdentity {
    pub fn display_name(&self) -> &str {
        match self {
            RemoteIdentity::Local { display_name } | RemoteIdentity::Peer { display_name, .. } => {
                display_name
            }
        }
    }

    /// Fingerprint of an authenticated peer's key.
    pub fn fingerprint(&self) -> Option<KeyFingerprint> {
        match self {
            RemoteIdentity::Local { .. } => None,
            RemoteIdentity::Peer { public_key, .. } => Some(public_key.fingerprint()),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RemoteIdentity::Local { .. })
    }
}

/// Inputs to one handshake.
pub struct HandshakeParams<'a> {
    /// Skip election, key exchange and authentication.
    pub local: bool,
    pub identity: &'a RsaIdentity,
    pub display_name: String,
    /// Precomputed keypairs from the connection slot.
    pub dh: DhKeyPair,
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Handshake {
    pub remote: RemoteIdentity,
    /// Whether this side won leader election (`false` for local connections).
    pub is_leader: bool,
}

async fn expect<R, T, F>(reader: &mut FrameReader<R>, expected: &'static str, pick: F) -> Result<T>
where
    R: AsyncRead + Unpin,
    F: FnOnce(Message) -> std::result::Result<T, Message>,
{
    let message = reader.read().await?;
    pick(message).map_err(|got| NetError::UnexpectedMessage {
        expected,
        got: got.kind(),
    })
}

macro_rules! expect_msg {
    ($reader:expr, $variant:ident) => {
        expect($reader, stringify!($variant), |m| match m {
            Message::$variant(body) => Ok(body),
            other => Err(other),
        })
    };
}

/// Run the handshake, installing the session ciphers on success.
pub async fn perform<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    params: HandshakeParams<'_>,
) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if params.local {
        return perform_local(reader, writer, &params.display_name).await;
    }

    let is_leader = elect_leader(reader, writer).await?;
    tracing::debug!(is_leader, "leader elected");

    writer
        .write(&msg::KeyExchange {
            public: params.dh.public(),
        }
        .into())
        .await?;
    let theirs = expect_msg!(reader, KeyExchange).await?;
    let keys = params.dh.agree(&theirs.public);

    let content_key = if is_leader {
        let key = ContentKey::generate();
        writer
            .write(&msg::ContentKey {
                payload: key.wrap(&keys),
            }
            .into())
            .await?;
        key
    } else {
        let wrapped = expect_msg!(reader, ContentKey).await?;
        ContentKey::unwrap_payload(&wrapped.payload, &keys)?
    };

    let (send, recv) = Direction::pair(is_leader);
    writer.set_cipher(DirectionalCipher::new(content_key.clone(), send));
    reader.set_cipher(DirectionalCipher::new(content_key, recv));

    let remote = authenticate(reader, writer, params.identity, &params.display_name).await?;
    Ok(Handshake { remote, is_leader })
}

/// The local (UI/CLI) handshake: a plain AuthRequest exchange.
///
/// Control clients call this directly; they need no key material.
pub async fn perform_local<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    display_name: &str,
) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write(&msg::AuthRequest {
            public_key: String::new(),
            display_name: display_name.to_string(),
        }
        .into())
        .await?;
    let request = expect_msg!(reader, AuthRequest).await?;
    let display_name = if request.display_name.is_empty() {
        LOCAL_MARKER.to_string()
    } else {
        request.display_name
    };
    Ok(Handshake {
        remote: RemoteIdentity::Local { display_name },
        is_leader: false,
    })
}

async fn elect_leader<R, W>(reader: &mut FrameReader<R>, writer: &mut FrameWriter<W>) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for round in 0..MAX_ELECTION_ROUNDS {
        let ours = election_value();
        writer.write(&msg::LeaderElect { value: ours }.into()).await?;
        let theirs = expect_msg!(reader, LeaderElect).await?.value;
        if ours != theirs {
            return Ok(ours > theirs);
        }
        tracing::debug!(round, "leader election tied, retrying");
    }
    Err(NetError::ElectionExhausted(MAX_ELECTION_ROUNDS))
}

async fn authenticate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    identity: &RsaIdentity,
    display_name: &str,
) -> Result<RemoteIdentity>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write(&msg::AuthRequest {
            public_key: identity.public_key().to_base64(),
            display_name: display_name.to_string(),
        }
        .into())
        .await?;
    let request = expect_msg!(reader, AuthRequest).await?;
    let public_key = PeerPublicKey::from_base64(&request.public_key)
        .map_err(|e| NetError::AuthenticationFailed(format!("bad public key: {}", e)))?;

    let challenge = random_challenge();
    writer
        .write(&msg::AuthChallenge {
            ciphertext: public_key.encrypt(&challenge)?,
        }
        .into())
        .await?;

    let theirs = expect_msg!(reader, AuthChallenge).await?;
    let plaintext = identity
        .decrypt_challenge(&theirs.ciphertext)
        .map_err(|e| NetError::AuthenticationFailed(format!("cannot answer challenge: {}", e)))?;
    writer.write(&msg::AuthSolution { plaintext }.into()).await?;

    let solution = expect_msg!(reader, AuthSolution).await?;
    let ok = bool::from(solution.plaintext.as_slice().ct_eq(&challenge[..]));
    writer.write(&msg::AuthResult { ok }.into()).await?;
    if !ok {
        return Err(NetError::AuthenticationFailed(
            "peer answered our challenge wrongly".into(),
        ));
    }

    let verdict = expect_msg!(reader, AuthResult).await?;
    if !verdict.ok {
        return Err(NetError::AuthenticationFailed("peer rejected our answer".into()));
    }

    Ok(RemoteIdentity::Peer {
        public_key,
        display_name: request.display_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshall::{framed, MAX_FRAME_LEN};
    use crate::messages::Ping;
    use std::sync::OnceLock;
    use tokio_util::sync::CancellationToken;

    fn identity(slot: usize) -> &'static RsaIdentity {
        static IDS: OnceLock<Vec<RsaIdentity>> = OnceLock::new();
        &IDS.get_or_init(|| (0..2).map(|_| RsaIdentity::generate(1024).unwrap()).collect())[slot]
    }

    fn params(local: bool, slot: usize, name: &str) -> HandshakeParams<'static> {
        HandshakeParams {
            local,
            identity: identity(slot),
            display_name: name.to_string(),
            dh: DhKeyPair::generate(),
        }
    }

    #[tokio::test]
    async fn test_remote_handshake_and_encrypted_traffic() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let cancel = CancellationToken::new();
        let (mut ra, mut wa) = framed(a, MAX_FRAME_LEN, cancel.clone());
        let (mut rb, mut wb) = framed(b, MAX_FRAME_LEN, cancel);

        let side_b = tokio::spawn(async move {
            let hs = perform(&mut rb, &mut wb, params(false, 1, "bob")).await.unwrap();
            let ping = rb.read().await.unwrap();
            wb.write(&ping).await.unwrap();
            hs
        });
        let hs_a = perform(&mut ra, &mut wa, params(false, 0, "alice")).await.unwrap();
        let hs_b = side_b.await.unwrap();

        assert_ne!(hs_a.is_leader, hs_b.is_leader);
        assert_eq!(hs_a.remote.display_name(), "bob");
        assert_eq!(hs_b.remote.display_name(), "alice");
        assert_eq!(hs_a.remote.fingerprint(), Some(identity(1).fingerprint()));
        assert_eq!(hs_b.remote.fingerprint(), Some(identity(0).fingerprint()));
        assert!(ra.is_encrypted());

        let ping = Message::from(Ping { nonce: 99 });
        wa.write(&ping).await.unwrap();
        assert_eq!(ra.read().await.unwrap(), ping);
    }

    #[tokio::test]
    async fn test_local_handshake_skips_crypto() {
        let (a, b) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let (mut ra, mut wa) = framed(a, MAX_FRAME_LEN, cancel.clone());
        let (mut rb, mut wb) = framed(b, MAX_FRAME_LEN, cancel);

        let ui = tokio::spawn(async move {
            perform(&mut rb, &mut wb, params(true, 1, "")).await.unwrap()
        });
        let hs = perform(&mut ra, &mut wa, params(true, 0, "backend")).await.unwrap();
        assert!(hs.remote.is_local());
        assert_eq!(hs.remote.display_name(), LOCAL_MARKER);
        assert!(!ra.is_encrypted());
        assert_eq!(ui.await.unwrap().remote.display_name(), "backend");
    }

    #[tokio::test]
    async fn test_tampered_content_key_aborts_follower() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let cancel = CancellationToken::new();
        let (mut r_evil, mut w_evil) = framed(a, MAX_FRAME_LEN, cancel.clone());
        let (mut rb, mut wb) = framed(b, MAX_FRAME_LEN, cancel);

        // A peer that always wins the election and sends a corrupted key.
        let evil = tokio::spawn(async move {
            loop {
                w_evil.write(&msg::LeaderElect { value: u64::MAX }.into()).await.unwrap();
                match r_evil.read().await.unwrap() {
                    Message::LeaderElect(m) if m.value == u64::MAX => continue,
                    Message::LeaderElect(_) => break,
                    other => panic!("unexpected {:?}", other.kind()),
                }
            }
            let dh = DhKeyPair::generate();
            w_evil.write(&msg::KeyExchange { public: dh.public() }.into()).await.unwrap();
            let theirs = match r_evil.read().await.unwrap() {
                Message::KeyExchange(k) => k,
                other => panic!("unexpected {:?}", other.kind()),
            };
            let keys = dh.agree(&theirs.public);
            let mut payload = ContentKey::generate().wrap(&keys);
            payload[40] ^= 0xff;
            w_evil.write(&msg::ContentKey { payload }.into()).await.unwrap();
        });

        let err = perform(&mut rb, &mut wb, params(false, 1, "bob")).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::Crypto(meshfs_crypto::CryptoError::MacMismatch)
        ));
        evil.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_message_is_fatal() {
        let (a, b) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let (_ra, mut wa) = framed(a, MAX_FRAME_LEN, cancel.clone());
        let (mut rb, mut wb) = framed(b, MAX_FRAME_LEN, cancel);

        wa.write(&Message::from(Ping { nonce: 1 })).await.unwrap();
        let err = perform(&mut rb, &mut wb, params(false, 1, "bob")).await.unwrap_err();
        assert!(matches!(
            err,
            NetError::UnexpectedMessage {
                expected: "LeaderElect",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_impostor_fails_challenge() {
        // The impostor presents identity 0's public key without holding the
        // private half, so it can only guess the answer.
        let (a, b) = tokio::io::duplex(1 << 16);
        let cancel = CancellationToken::new();
        let (mut ra, mut wa) = framed(a, MAX_FRAME_LEN, cancel.clone());
        let (mut rb, mut wb) = framed(b, MAX_FRAME_LEN, cancel);

        let honest = tokio::spawn(async move {
            perform(&mut rb, &mut wb, params(false, 1, "bob")).await
        });

        let is_leader = elect_leader(&mut ra, &mut wa).await.unwrap();
        let dh = DhKeyPair::generate();
        wa.write(&msg::KeyExchange { public: dh.public() }.into()).await.unwrap();
        let theirs = match ra.read().await.unwrap() {
            Message::KeyExchange(k) => k,
            other => panic!("unexpected {:?}", other.kind()),
        };
        let keys = dh.agree(&theirs.public);
        let key = if is_leader {
            let key = ContentKey::generate();
            wa.write(&msg::ContentKey { payload: key.wrap(&keys) }.into()).await.unwrap();
            key
        } else {
            match ra.read().await.unwrap() {
                Message::ContentKey(k) => ContentKey::unwrap_payload(&k.payload, &keys).unwrap(),
                other => panic!("unexpected {:?}", other.kind()),
            }
        };
        let (send, recv) = Direction::pair(is_leader);
        wa.set_cipher(DirectionalCipher::new(key.clone(), send));
        ra.set_cipher(DirectionalCipher::new(key, recv));

        wa.write(&msg::AuthRequest {
            public_key: identity(0).public_key().to_base64(),
            display_name: "alice".into(),
        }
        .into())
        .await
        .unwrap();
        let _ = ra.read().await.unwrap();
        let ciphertext = identity(1).public_key().encrypt(&random_challenge()).unwrap();
        wa.write(&msg::AuthChallenge { ciphertext }.into())
            .await
            .unwrap();
        let _ = ra.read().await.unwrap();
        wa.write(&msg::AuthSolution { plaintext: vec![0; 32] }.into())
            .await
            .unwrap();

        let result = honest.await.unwrap();
        assert!(matches!(result, Err(NetError::AuthenticationFailed(_))));
    }
}
