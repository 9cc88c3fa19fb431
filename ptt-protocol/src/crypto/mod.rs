//! Signing, key derivation, key-chain certificates and the join channel.

pub mod join_key;
pub mod key_chain;
pub mod signing;

pub use join_key::{join_key_hash, joiner_session, open, seal, JoinKey, JoinKeyError};
pub use key_chain::{verify_chain, KeyChainError, KeyExtra, KeyLink, KeyPurpose};
pub use signing::{
    decode_my_key, derive_child, derive_public_key, encode_my_key, generate_keypair, sign_data,
    verify_signature, SigningError,
};

/// BLAKE3 of a public key; the lookup hash peers use to select a signing key.
pub fn key_hash(pubkey: &[u8; 32]) -> [u8; 32] {
    *blake3::hash(pubkey).as_bytes()
}
