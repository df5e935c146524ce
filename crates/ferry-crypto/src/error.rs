//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted")]
    NonceOverflow,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key exchange produced an all-zero secret (low-order point)
    #[error("key exchange rejected: low-order point")]
    LowOrderPoint,
}
