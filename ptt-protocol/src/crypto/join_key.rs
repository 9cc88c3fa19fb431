/// Join keys and the sealed join channel.
///
/// An inviting node publishes the public half of a short-lived X25519 join
/// key (and its hash) inside a join URL. The joiner generates an ephemeral
/// X25519 key, derives a session key with HKDF-SHA256 over the DH output,
/// and both sides seal their join messages with XChaCha20-Poly1305.
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ErrorKind;
use crate::types::Timestamp;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinKeyError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Sealing failed")]
    SealFailed,
    #[error("Opening sealed payload failed")]
    OpenFailed,
}

impl JoinKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JoinKeyError::OpenFailed => ErrorKind::Unauthorized,
            _ => ErrorKind::BadInput,
        }
    }
}

pub type Result<T> = std::result::Result<T, JoinKeyError>;

const SESSION_INFO: &[u8] = b"ptt-join-session-v1";
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Hash that identifies a join key in URLs and requests: BLAKE3(pub).
pub fn join_key_hash(public: &[u8; 32]) -> [u8; 32] {
    *blake3::hash(public).as_bytes()
}

/// A static join key held by the inviting node.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct JoinKey {
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
    #[zeroize(skip)]
    pub hash: [u8; 32],
    #[zeroize(skip)]
    pub create_ts: Timestamp,
    #[zeroize(skip)]
    pub expire_ts: Timestamp,
}

impl JoinKey {
    pub fn generate(now: Timestamp, lifetime_secs: i64) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        JoinKey {
            secret: secret.to_bytes(),
            public,
            hash: join_key_hash(&public),
            create_ts: now,
            expire_ts: now.plus_seconds(lifetime_secs),
        }
    }

    /// Rebuild a stored key.
    pub fn from_secret(secret: [u8; 32], create_ts: Timestamp, expire_ts: Timestamp) -> Self {
        let public = PublicKey::from(&StaticSecret::from(secret)).to_bytes();
        JoinKey {
            secret,
            public,
            hash: join_key_hash(&public),
            create_ts,
            expire_ts,
        }
    }

    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expire_ts
    }

    /// Session key for a joiner that presented `their_ephemeral_pub`.
    pub fn session_key(&self, their_ephemeral_pub: &[u8; 32]) -> Result<[u8; 32]> {
        let secret = StaticSecret::from(self.secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*their_ephemeral_pub));
        derive_session_key(shared.as_bytes(), &self.hash)
    }
}

impl std::fmt::Debug for JoinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JoinKey({}..)", &hex::encode(self.hash)[..12])
    }
}

/// Joiner side: generate an ephemeral key and derive the session key against
/// the inviter's published join key.
///
/// # Returns
/// (ephemeral_public, session_key)
pub fn joiner_session(join_key_pub: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&PublicKey::from(*join_key_pub));
    let key = derive_session_key(shared.as_bytes(), &join_key_hash(join_key_pub))?;
    Ok((public, key))
}

fn derive_session_key(shared: &[u8; 32], join_key_hash: &[u8; 32]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(join_key_hash), shared);
    let mut key = [0u8; 32];
    hk.expand(SESSION_INFO, &mut key)
        .map_err(|_| JoinKeyError::KeyDerivationFailed)?;
    Ok(key)
}

/// Seal with XChaCha20-Poly1305; output is `nonce(24) || ciphertext`.
pub fn seal(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| JoinKeyError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| JoinKeyError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload produced by [`seal`].
pub fn open(sealed: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(JoinKeyError::OpenFailed);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| JoinKeyError::InvalidKeyLength)?;
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| JoinKeyError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_session_key() {
        let join_key = JoinKey::generate(Timestamp::from_seconds(100), 86400);
        let (eph_pub, joiner_key) = joiner_session(&join_key.public).unwrap();
        let inviter_key = join_key.session_key(&eph_pub).unwrap();
        assert_eq!(joiner_key, inviter_key);
    }

    #[test]
    fn test_seal_open() {
        let key = [0x42u8; 32];
        let sealed = seal(b"join me", &key).unwrap();
        assert_eq!(open(&sealed, &key).unwrap(), b"join me");
        assert_eq!(open(&sealed, &[0x43u8; 32]), Err(JoinKeyError::OpenFailed));
        assert_eq!(open(&sealed[..10], &key), Err(JoinKeyError::OpenFailed));
    }

    #[test]
    fn test_expiry_and_hash() {
        let join_key = JoinKey::generate(Timestamp::from_seconds(100), 50);
        assert!(!join_key.is_expired(Timestamp::from_seconds(150)));
        assert!(join_key.is_expired(Timestamp::from_seconds(151)));
        assert_eq!(join_key.hash, join_key_hash(&join_key.public));
    }
}
