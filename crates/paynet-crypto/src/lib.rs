//! Cryptography for the payment network node.
//!
//! Everything the node signs or seals goes through this crate:
//!
//! 1. **Identity and state signatures**: Ed25519 keypairs sign semi-channel
//!    states and virtual-channel resolves.
//! 2. **Tunnel sealing**: onion instruction layers are sealed to a hop's
//!    long-term Ed25519 key with a static-ephemeral ECDH (Ed25519 keys mapped
//!    to X25519) and AES-256-GCM under an HMAC-derived key.
//! 3. **Webhook authentication**: HMAC-SHA256 over the raw request body.

pub mod ed25519;
pub mod kdf;
pub mod sealed;
pub mod sha256;
pub mod x25519;

pub use ed25519::{verify_signature, Ed25519Keypair};
pub use kdf::hmac_sha256;
pub use sealed::{open, seal, sealed_key, SealedBoxError, SEALED_OVERHEAD};
pub use sha256::sha256;
pub use x25519::{ecdh_ed25519, ed25519_to_x25519_private, ed25519_to_x25519_public, X25519Error};

/// Generate a cryptographically secure random 32-byte array.
pub fn random_bytes_32() -> [u8; 32] {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Fill a slice with cryptographically secure random bytes.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(dest);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_seal_flow() {
        let node = Ed25519Keypair::generate();
        let hop = Ed25519Keypair::generate();

        let message = b"instruction layer";
        let signature = node.sign(message);
        assert!(verify_signature(&node.public_key, message, &signature).is_ok());

        let sealed = seal(&hop.public_key, message).unwrap();
        let opened = open(&hop, &sealed).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn random_bytes_differ() {
        assert_ne!(random_bytes_32(), random_bytes_32());
    }
}
