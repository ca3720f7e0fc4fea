//! Cryptographic operations for the notary
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification
//! - The `Signer` capability consumed by ledgers, messages and instruments
//! - SHA-256 hashing of canonical bytes

use crate::types::{NymId, Signature, SignedBy};
use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Signing capability of a nym or notary
pub trait Signer {
    /// Public key bytes
    fn public_key(&self) -> [u8; 32];

    /// Sign a message
    fn sign(&self, message: &[u8]) -> Signature;

    /// Nym ID derived from the public key
    fn nym_id(&self) -> NymId {
        NymId::from_public_key(&self.public_key())
    }

    /// Sign and attach the public key
    fn sign_detached(&self, message: &[u8]) -> SignedBy {
        SignedBy {
            public_key: self.public_key(),
            signature: self.sign(message),
        }
    }
}

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Verify a signature made by this key pair
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(message, &dalek_sig)
            .map_err(|e| Error::SignatureInvalid(format!("Verification failed: {}", e)))
    }
}

impl Signer for KeyPair {
    fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        let signature = self.signing_key.sign(message);
        Signature::from_bytes(signature.to_bytes())
    }
}

/// Verify a signature with a public key
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &[u8; 32]) -> bool {
    let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_seed() {
        let seed = [42u8; 32];
        let keypair1 = KeyPair::from_seed(&seed);
        let keypair2 = KeyPair::from_seed(&seed);

        assert_eq!(keypair1.public_key(), keypair2.public_key());
        assert_eq!(keypair1.nym_id(), keypair2.nym_id());
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"balance statement";

        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature).is_ok());
        assert!(keypair.verify(b"tampered statement", &signature).is_err());
    }

    #[test]
    fn test_verify_signature_wrong_key() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"message");

        assert!(verify_signature(b"message", &signature, &keypair.public_key()));
        let other = KeyPair::generate();
        assert!(!verify_signature(b"message", &signature, &other.public_key()));
    }

    #[test]
    fn test_sign_detached() {
        let keypair = KeyPair::generate();
        let signed = keypair.sign_detached(b"ledger");
        assert_eq!(signed.nym_id(), keypair.nym_id());
        assert!(signed.verify(b"ledger").is_ok());
        assert!(matches!(
            signed.verify(b"other"),
            Err(Error::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_hash_bytes() {
        assert_eq!(hash_bytes(b"data"), hash_bytes(b"data"));
        assert_ne!(hash_bytes(b"data"), hash_bytes(b"other"));
    }
}
