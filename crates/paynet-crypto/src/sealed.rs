//! Sealed boxes for onion instruction layers.
//!
//! A layer is sealed to a hop's long-term Ed25519 key: an ephemeral Ed25519
//! key performs ECDH against it, the AES-256-GCM key is derived as
//! HMAC-SHA256(shared, ephemeral-public), and the recipient key is bound as
//! associated data. The blob is `ephemeral-public || nonce || ciphertext`, so
//! the ephemeral public key doubles as the instruction's address tag.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use thiserror::Error;

use crate::ed25519::Ed25519Keypair;
use crate::kdf::hmac_sha256;
use crate::x25519::ecdh_ed25519;

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes a sealed blob adds on top of the plaintext length.
pub const SEALED_OVERHEAD: usize = EPHEMERAL_LEN + NONCE_LEN + TAG_LEN;

/// Errors from sealing and opening.
#[derive(Debug, Error)]
pub enum SealedBoxError {
    #[error("recipient key is not a valid curve point")]
    InvalidRecipient,

    #[error("sealed blob is truncated")]
    Truncated,

    #[error("decryption failed")]
    DecryptionFailed,
}

/// Seal `plaintext` to the holder of `recipient` (an Ed25519 public key).
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SealedBoxError> {
    let ephemeral = Ed25519Keypair::generate();
    let shared = ecdh_ed25519(ephemeral.private_key_bytes(), recipient)
        .map_err(|_| SealedBoxError::InvalidRecipient)?;
    let key = hmac_sha256(&shared, &ephemeral.public_key);

    let mut nonce = [0u8; NONCE_LEN];
    crate::fill_random(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: recipient,
            },
        )
        .map_err(|_| SealedBoxError::DecryptionFailed)?;

    let mut blob = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&ephemeral.public_key);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// The ephemeral public key a sealed blob was produced with, usable as an
/// address tag without opening the blob.
pub fn sealed_key(blob: &[u8]) -> Result<[u8; 32], SealedBoxError> {
    if blob.len() < SEALED_OVERHEAD {
        return Err(SealedBoxError::Truncated);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&blob[..EPHEMERAL_LEN]);
    Ok(key)
}

/// Open a sealed blob addressed to `us`.
pub fn open(us: &Ed25519Keypair, blob: &[u8]) -> Result<Vec<u8>, SealedBoxError> {
    if blob.len() < SEALED_OVERHEAD {
        return Err(SealedBoxError::Truncated);
    }
    let ephemeral: [u8; 32] = blob[..EPHEMERAL_LEN].try_into().expect("length checked");
    let nonce = &blob[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN];
    let ciphertext = &blob[EPHEMERAL_LEN + NONCE_LEN..];

    let shared = ecdh_ed25519(us.private_key_bytes(), &ephemeral)
        .map_err(|_| SealedBoxError::DecryptionFailed)?;
    let key = hmac_sha256(&shared, &ephemeral);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &us.public_key,
            },
        )
        .map_err(|_| SealedBoxError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let hop = Ed25519Keypair::generate();
        let blob = seal(&hop.public_key, b"forward to the next hop").unwrap();
        assert_eq!(open(&hop, &blob).unwrap(), b"forward to the next hop");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let hop = Ed25519Keypair::generate();
        let eavesdropper = Ed25519Keypair::generate();
        let blob = seal(&hop.public_key, b"secret").unwrap();
        assert!(matches!(
            open(&eavesdropper, &blob),
            Err(SealedBoxError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampering_is_detected() {
        let hop = Ed25519Keypair::generate();
        let mut blob = seal(&hop.public_key, b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 1;
        assert!(open(&hop, &blob).is_err());
    }

    #[test]
    fn sealed_key_matches_layer() {
        let hop = Ed25519Keypair::generate();
        let blob = seal(&hop.public_key, b"x").unwrap();
        assert_eq!(sealed_key(&blob).unwrap(), blob[..32]);
    }

    #[test]
    fn overhead_is_exact() {
        let hop = Ed25519Keypair::generate();
        let blob = seal(&hop.public_key, &[0u8; 100]).unwrap();
        assert_eq!(blob.len(), 100 + SEALED_OVERHEAD);
    }
}
