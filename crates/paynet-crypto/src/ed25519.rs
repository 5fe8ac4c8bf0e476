//! Ed25519 signing keys and signature verification.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors from Ed25519 operations.
#[derive(Debug, Error)]
pub enum Ed25519Error {
    #[error("invalid key bytes: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    VerificationFailed,
}

/// An Ed25519 keypair. The private seed is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519Keypair {
    private_key: [u8; 32],
    /// Public key bytes (not secret).
    #[zeroize(skip)]
    pub public_key: [u8; 32],
    /// The dalek signing key carries the same secret as `private_key`,
    /// which is the field that gets zeroized.
    #[zeroize(skip)]
    signing_key: SigningKey,
}

impl Ed25519Keypair {
    /// Generate a fresh keypair from the OS random number generator.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Rebuild a keypair from a 32-byte private seed.
    pub fn from_private_key(private_key: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&private_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(signing_key.as_bytes());
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            private_key,
            public_key,
            signing_key,
        }
    }

    /// Sign a message, producing a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key_bytes(&self) -> &[u8; 32] {
        &self.private_key
    }
}

impl std::fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field("public_key", &hex_prefix(&self.public_key))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(key: &[u8; 32]) -> String {
    key[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Verify a signature with a bare public key.
pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), Ed25519Error> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Ed25519Error::InvalidKey(e.to_string()))?;
    let signature = Signature::from_bytes(signature);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| Ed25519Error::VerificationFailed)
}

/// Verify a signature given as slices, checking lengths first.
pub fn verify_signature_slice(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), Ed25519Error> {
    let public_key: [u8; 32] = public_key
        .try_into()
        .map_err(|_| Ed25519Error::InvalidKey(format!("expected 32 bytes, got {}", public_key.len())))?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| Ed25519Error::VerificationFailed)?;
    verify_signature(&public_key, message, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = Ed25519Keypair::generate();
        let signature = keypair.sign(b"state");
        assert!(verify_signature(&keypair.public_key, b"state", &signature).is_ok());
        assert!(verify_signature(&keypair.public_key, b"other", &signature).is_err());
    }

    #[test]
    fn corrupted_signature_fails() {
        let keypair = Ed25519Keypair::generate();
        let mut signature = keypair.sign(b"state");
        signature[0] ^= 0xFF;
        assert!(verify_signature(&keypair.public_key, b"state", &signature).is_err());
    }

    #[test]
    fn seed_round_trip() {
        let keypair = Ed25519Keypair::generate();
        let restored = Ed25519Keypair::from_private_key(*keypair.private_key_bytes());
        assert_eq!(keypair.public_key, restored.public_key);
    }

    #[test]
    fn signing_is_deterministic() {
        let keypair = Ed25519Keypair::generate();
        assert_eq!(keypair.sign(b"x"), keypair.sign(b"x"));
    }

    #[test]
    fn slice_verification_checks_lengths() {
        let keypair = Ed25519Keypair::generate();
        let signature = keypair.sign(b"m");
        assert!(verify_signature_slice(&keypair.public_key, b"m", &signature).is_ok());
        assert!(verify_signature_slice(&[0u8; 31], b"m", &signature).is_err());
        assert!(verify_signature_slice(&keypair.public_key, b"m", &signature[..63]).is_err());
    }
}
