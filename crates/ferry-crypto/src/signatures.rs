//! Ed25519 identity signatures.
//!
//! Every node owns one long-term Ed25519 key. It never encrypts anything;
//! it only signs the handshake transcript so the remote side can bind the
//! ephemeral key exchange to a stable identity.
//!
//! - 64-byte signatures
//! - 32-byte public keys
//! - 32-byte private seeds (zeroized on drop)
//! - Deterministic signature generation
//!
//! ## Usage
//!
//! ```ignore
//! use ferry_crypto::signatures::SigningKey;
//! use rand_core::OsRng;
//!
//! let signing_key = SigningKey::generate(&mut OsRng);
//! let verifying_key = signing_key.verifying_key();
//!
//! let signature = signing_key.sign(b"transcript");
//! assert!(verifying_key.verify(b"transcript", &signature).is_ok());
//! ```

use crate::CryptoError;
use ed25519_dalek::{Signer, Verifier};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Ed25519 signature (64 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create a signature from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not exactly 64 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 64] = slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(bytes))
    }

    /// Get the raw signature bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    fn to_dalek(self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

/// Ed25519 signing key (long-term identity secret)
///
/// Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a new random signing key
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Create from a raw 32-byte seed
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes())
    }

    /// Get the corresponding verifying key (public key)
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Export the 32-byte seed
    ///
    /// # Security
    ///
    /// This exposes the raw secret. The caller owns zeroization of the copy.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }
}

/// Ed25519 verifying key (public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Create from raw 32-byte public key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a valid
    /// Ed25519 point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { inner })
    }

    /// Get the raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verify a signature on a message
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message under this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.inner
            .verify(message, &signature.to_dalek())
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let message = b"authenticate this message";
        let signature = signing_key.sign(message);

        assert!(verifying_key.verify(message, &signature).is_ok());
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signature = signing_key.sign(b"original message");

        assert!(
            signing_key
                .verifying_key()
                .verify(b"tampered message", &signature)
                .is_err()
        );
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let signing_key1 = SigningKey::generate(&mut OsRng);
        let signing_key2 = SigningKey::generate(&mut OsRng);

        let signature = signing_key1.sign(b"test");

        assert!(signing_key2.verifying_key().verify(b"test", &signature).is_err());
    }

    #[test]
    fn test_signature_from_slice_wrong_size() {
        assert!(Signature::from_slice(&[0u8; 32]).is_err());
        assert!(Signature::from_slice(&[0u8; 128]).is_err());
    }

    #[test]
    fn test_signing_key_seed_roundtrip() {
        let original = SigningKey::generate(&mut OsRng);
        let recovered = SigningKey::from_bytes(&original.to_bytes());

        assert_eq!(original.verifying_key(), recovered.verifying_key());
        assert_eq!(original.sign(b"m"), recovered.sign(b"m"));
    }

    #[test]
    fn test_tampered_signature_fails() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signature = signing_key.sign(b"test message");

        let mut tampered = *signature.as_bytes();
        tampered[0] ^= 0xFF;

        assert!(
            signing_key
                .verifying_key()
                .verify(b"test message", &Signature::from_bytes(tampered))
                .is_err()
        );
    }
}
