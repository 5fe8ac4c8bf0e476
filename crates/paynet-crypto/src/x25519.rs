//! X25519 key agreement over Ed25519 identities.
//!
//! Nodes are identified by Ed25519 keys, so key agreement maps both sides to
//! the Montgomery curve first: the private seed through SHA-512 and clamping,
//! the public key through the Edwards-to-Montgomery birational map.

use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Errors from X25519 operations.
#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("weak public key produced an all-zero shared secret")]
    WeakKey,
}

/// Map an Ed25519 private seed to an X25519 scalar: SHA-512, take the first
/// 32 bytes, clamp per RFC 7748.
pub fn ed25519_to_x25519_private(ed25519_private_key: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_private_key);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&hash[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    scalar
}

/// Map an Ed25519 public key to the equivalent X25519 public key.
pub fn ed25519_to_x25519_public(ed25519_public_key: &[u8; 32]) -> Result<[u8; 32], X25519Error> {
    let compressed = CompressedEdwardsY::from_slice(ed25519_public_key)
        .map_err(|_| X25519Error::InvalidKey("bad key length".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| X25519Error::InvalidKey("not a curve point".into()))?;
    Ok(point.to_montgomery().to_bytes())
}

/// ECDH between an Ed25519 private seed and an Ed25519 public key.
pub fn ecdh_ed25519(
    my_ed25519_private: &[u8; 32],
    their_ed25519_public: &[u8; 32],
) -> Result<[u8; 32], X25519Error> {
    let secret = StaticSecret::from(ed25519_to_x25519_private(my_ed25519_private));
    let public = PublicKey::from(ed25519_to_x25519_public(their_ed25519_public)?);
    let shared = secret.diffie_hellman(&public);
    let shared = shared.to_bytes();
    if shared.iter().all(|b| *b == 0) {
        return Err(X25519Error::WeakKey);
    }
    Ok(shared)
}
