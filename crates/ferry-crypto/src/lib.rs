//! # Ferry Crypto
//!
//! Cryptographic primitives for the Ferry secure channel.
//!
//! This crate provides:
//! - Ed25519 identity keys and signatures
//! - X25519 ephemeral Diffie-Hellman
//! - `XChaCha20-Poly1305` AEAD with counter nonces
//! - BLAKE3 hashing and HKDF-style key derivation
//! - A sans-I/O signed key exchange (SIGMA-I shape) producing per-direction keys
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | HKDF-BLAKE3 | 128-bit |
//! | Signatures | Ed25519 | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Per-session nonce salt size
pub const NONCE_SALT_SIZE: usize = 16;

/// Traffic keys derived from a completed handshake.
///
/// Each direction has its own key and nonce salt so that no key/nonce pair
/// is ever used by both peers.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for sending data
    pub send_key: [u8; 32],
    /// Key for receiving data
    pub recv_key: [u8; 32],
    /// Nonce salt for the sending direction
    pub send_salt: [u8; NONCE_SALT_SIZE],
    /// Nonce salt for the receiving direction
    pub recv_salt: [u8; NONCE_SALT_SIZE],
}

impl SessionKeys {
    /// Build the sending-direction cipher.
    #[must_use]
    pub fn sender(&self) -> aead::CipherState {
        aead::CipherState::new(self.send_key, self.send_salt)
    }

    /// Build the receiving-direction cipher.
    #[must_use]
    pub fn receiver(&self) -> aead::CipherState {
        aead::CipherState::new(self.recv_key, self.recv_salt)
    }
}
