//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! Used only for per-connection ephemeral keys; identity is carried by
//! Ed25519 (see [`crate::signatures`]).
//!
//! - Low-order point rejection
//! - Automatic key clamping (RFC 7748)
//! - Zeroization of secrets

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] if the peer's public key yields
    /// an all-zero shared secret.
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if !shared.was_contributory() {
            return Err(CryptoError::LowOrderPoint);
        }

        Ok(SharedSecret(shared))
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Get bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Get shared secret as bytes.
    ///
    /// Must go through the KDF in [`crate::hash`] before use as a key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_x25519_key_exchange() {
        let alice_private = PrivateKey::generate(&mut OsRng);
        let bob_private = PrivateKey::generate(&mut OsRng);

        let alice_shared = alice_private.exchange(&bob_private.public_key()).unwrap();
        let bob_shared = bob_private.exchange(&alice_private.public_key()).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_reject_low_order_points() {
        let private = PrivateKey::generate(&mut OsRng);

        let zero_public = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            private.exchange(&zero_public),
            Err(CryptoError::LowOrderPoint)
        ));
    }

    #[test]
    fn test_public_key_bytes_roundtrip() {
        let public = PrivateKey::generate(&mut OsRng).public_key();
        assert_eq!(PublicKey::from_bytes(public.to_bytes()), public);
    }
}
