//! `XChaCha20-Poly1305` AEAD encryption.
//!
//! Provides authenticated encryption with associated data (AEAD) using
//! `XChaCha20-Poly1305`:
//! - 256-bit keys
//! - 192-bit nonces built from a 64-bit counter and a 128-bit session salt
//! - 128-bit authentication tags
//!
//! [`CipherState`] owns one direction of a secure channel. Its counter only
//! moves forward, so a replayed, dropped or reordered frame can never be
//! opened with the nonce it was sealed under.

use crate::{CryptoError, NONCE_SALT_SIZE};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a counter value.
    ///
    /// The counter is placed in the first 8 bytes (little-endian),
    /// the remaining 16 bytes carry the per-direction salt.
    #[must_use]
    pub fn from_counter(counter: u64, salt: &[u8; NONCE_SALT_SIZE]) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        bytes[8..].copy_from_slice(salt);
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .encrypt(
                nonce.as_generic(),
                chacha20poly1305::aead::Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// Input must include the authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(
                nonce.as_generic(),
                chacha20poly1305::aead::Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// One direction of an established secure channel.
///
/// Seals or opens frames in strict order; the nonce is never transmitted.
#[derive(ZeroizeOnDrop)]
pub struct CipherState {
    key: AeadKey,
    #[zeroize(skip)]
    salt: [u8; NONCE_SALT_SIZE],
    #[zeroize(skip)]
    counter: u64,
}

impl CipherState {
    /// Create a cipher state starting at counter zero.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], salt: [u8; NONCE_SALT_SIZE]) -> Self {
        Self {
            key: AeadKey::new(key),
            salt,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<Nonce, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.counter, &self.salt);
        self.counter += 1;
        Ok(nonce)
    }

    /// Encrypt the next outgoing frame.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceOverflow` once the counter is exhausted and
    /// `CryptoError::EncryptionFailed` on AEAD failure.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        self.key.encrypt(&nonce, plaintext, aad)
    }

    /// Decrypt the next incoming frame.
    ///
    /// The counter advances even on failure: a frame that failed
    /// authentication is never retried under the same nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn open(&mut self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        self.key.decrypt(&nonce, ciphertext, aad)
    }

    /// Number of frames processed in this direction.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }
}
