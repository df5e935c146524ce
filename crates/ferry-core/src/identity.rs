//! Peer identity
//!
//! Every node owns one long-term Ed25519 keypair. Its [`PeerId`] is the
//! BLAKE3 digest of the public key encoding (`0x01 || key bytes`, where
//! `0x01` tags the key type) and is what appears after `/p2p/` in
//! addresses.
//!
//! # Example
//!
//! ```
//! use ferry_core::identity::Identity;
//!
//! let identity = Identity::generate();
//! println!("Peer ID: {}", identity.peer_id());
//! ```

use crate::error::{Error, Result};
use ferry_crypto::signatures::{SigningKey, VerifyingKey};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Key-type tag for Ed25519 in the peer id encoding
const KEY_TYPE_ED25519: u8 = 0x01;

/// Stable peer identifier derived from a public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the identifier for an Ed25519 public key.
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[KEY_TYPE_ED25519]);
        hasher.update(&key.to_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Wrap raw digest bytes (as found in a `/p2p/` component).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// First 8 bytes in hex, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidIdentity("peer id is not hex".into()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdentity("peer id must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }
}

/// Node identity: signing key plus the identifier derived from it
///
/// # Security
///
/// The signing key is zeroized on drop.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    public_key: VerifyingKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a random identity
    #[must_use]
    pub fn generate() -> Self {
        use rand_core::OsRng;
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Build an identity from a 32-byte Ed25519 seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Build an identity from a hex-encoded seed (as written by `ferry keygen`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] if the input is not 64 hex characters.
    pub fn from_hex_seed(hex_seed: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(hex_seed.trim())
                .map_err(|_| Error::InvalidIdentity("seed is not hex".into()))?,
        );
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidIdentity("seed must be 32 bytes".into()))?,
        );
        Ok(Self::from_seed(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = signing_key.verifying_key();
        let peer_id = PeerId::from_public_key(&public_key);
        Self {
            signing_key,
            public_key,
            peer_id,
        }
    }

    /// Signing key used by the secure handshake
    #[must_use]
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Ed25519 public key
    #[must_use]
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Peer identifier
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Hex-encoded seed for persisting the identity
    #[must_use]
    pub fn to_hex_seed(&self) -> Zeroizing<String> {
        let seed = Zeroizing::new(self.signing_key.to_bytes());
        Zeroizing::new(hex::encode(&*seed))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
