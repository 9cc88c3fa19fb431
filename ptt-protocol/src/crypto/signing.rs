use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

use crate::error::ErrorKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Key derivation failed")]
    DerivationFailed,
    #[error("Invalid key text: {0}")]
    InvalidKeyText(String),
}

impl SigningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SigningError::InvalidKeyText(_) => ErrorKind::BadInput,
            _ => ErrorKind::Unauthorized,
        }
    }
}

pub type Result<T> = std::result::Result<T, SigningError>;

const DERIVE_SALT: &[u8] = b"ptt-derive-child-v1";

/// Generate an Ed25519 keypair
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);

    let secret_key = signing_key.to_bytes();
    let public_key = signing_key.verifying_key().to_bytes();

    (public_key, secret_key)
}

/// Sign data with Ed25519 private key
///
/// # Arguments
/// * `data` - Data to sign
/// * `private_key` - 32-byte Ed25519 private key
///
/// # Returns
/// 64-byte signature
pub fn sign_data(data: &[u8], private_key: &[u8]) -> Result<[u8; 64]> {
    if private_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(private_key);
    let signing_key = SigningKey::from_bytes(&key_bytes);
    key_bytes.zeroize();

    Ok(signing_key.sign(data).to_bytes())
}

/// Verify Ed25519 signature
///
/// # Returns
/// True if signature is valid
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool> {
    if public_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    if signature.len() != 64 {
        return Err(SigningError::InvalidSignature);
    }

    let mut pub_bytes = [0u8; 32];
    pub_bytes.copy_from_slice(public_key);
    let verifying_key =
        VerifyingKey::from_bytes(&pub_bytes).map_err(|_| SigningError::InvalidPublicKey)?;

    let mut sig_bytes = [0u8; 64];
    sig_bytes.copy_from_slice(signature);
    let sig = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(data, &sig).is_ok())
}

/// Derive public key from private key
pub fn derive_public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    if private_key.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(private_key);
    let signing_key = SigningKey::from_bytes(&key_bytes);
    key_bytes.zeroize();

    Ok(signing_key.verifying_key().to_bytes())
}

/// Deterministically derive a child keypair from a parent private key.
///
/// Every holder of `parent_private` derives the same child for the same
/// `purpose`, which is what lets all of a user's devices re-derive an OpKey
/// issued by whichever device led at the time.
///
/// # Returns
/// (child_public, child_private)
pub fn derive_child(parent_private: &[u8], purpose: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if parent_private.len() != 32 {
        return Err(SigningError::InvalidKeyLength);
    }

    let hk = Hkdf::<Sha256>::new(Some(DERIVE_SALT), parent_private);
    let mut seed = [0u8; 32];
    hk.expand(purpose, &mut seed)
        .map_err(|_| SigningError::DerivationFailed)?;

    let signing_key = SigningKey::from_bytes(&seed);
    seed.zeroize();

    Ok((signing_key.verifying_key().to_bytes(), signing_key.to_bytes()))
}

/// Text form of a master private key as shown by `me_showMyKey`.
pub fn encode_my_key(private_key: &[u8; 32]) -> String {
    bs58::encode(private_key).into_string()
}

/// Parse the text form produced by [`encode_my_key`].
pub fn decode_my_key(text: &str) -> Result<[u8; 32]> {
    let mut bytes = bs58::decode(text.trim())
        .into_vec()
        .map_err(|e| SigningError::InvalidKeyText(e.to_string()))?;
    if bytes.len() != 32 {
        let len = bytes.len();
        bytes.zeroize();
        return Err(SigningError::InvalidKeyText(format!("length {}", len)));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}
