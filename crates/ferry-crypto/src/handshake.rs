//! Signed ephemeral key exchange (SIGMA-I shape).
//!
//! Three messages authenticate both peers' Ed25519 identities and derive
//! per-direction traffic keys. The identities travel encrypted, so a
//! passive observer only sees two ephemeral X25519 keys.
//!
//! ```text
//! M1  I -> R   version(1) || eph_I(32)
//! M2  R -> I   eph_R(32)  || AEAD_hsR(identity_R(32) || sig_R(64))
//! M3  I -> R   AEAD_hsI(identity_I(32) || sig_I(64))
//!
//! th    = BLAKE3("ferry-sigdh-v1" || eph_I || eph_R)
//! prk   = HKDF-Extract(th, X25519(eph_I, eph_R))
//! sig_R = Sign(id_R, "ferry-sigdh-v1 responder" || th)
//! sig_I = Sign(id_I, "ferry-sigdh-v1 initiator" || th || identity_R)
//! ```
//!
//! This module is sans-I/O: it consumes and produces message bodies only.
//! Framing and timeouts belong to the caller.

use crate::aead::{AeadKey, Nonce, TAG_SIZE};
use crate::hash::{hash_parts, hkdf_expand, hkdf_extract};
use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::x25519::{PrivateKey, PublicKey};
use crate::{
    CryptoError, ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE, NONCE_SALT_SIZE, SessionKeys,
    X25519_PUBLIC_KEY_SIZE,
};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Handshake wire version carried in the first message.
pub const HANDSHAKE_VERSION: u8 = 1;

/// Size of the first message body.
pub const MESSAGE_1_SIZE: usize = 1 + X25519_PUBLIC_KEY_SIZE;

/// Size of an encrypted identity proof (`identity || signature` + tag).
pub const PROOF_SIZE: usize = ED25519_PUBLIC_KEY_SIZE + ED25519_SIGNATURE_SIZE + TAG_SIZE;

/// Size of the second message body.
pub const MESSAGE_2_SIZE: usize = X25519_PUBLIC_KEY_SIZE + PROOF_SIZE;

/// Size of the third message body.
pub const MESSAGE_3_SIZE: usize = PROOF_SIZE;

const PROTOCOL_LABEL: &[u8] = b"ferry-sigdh-v1";
const RESPONDER_SIG_LABEL: &[u8] = b"ferry-sigdh-v1 responder";
const INITIATOR_SIG_LABEL: &[u8] = b"ferry-sigdh-v1 initiator";
const HS_RESPONDER_INFO: &[u8] = b"ferry hs responder";
const HS_INITIATOR_INFO: &[u8] = b"ferry hs initiator";
const TRAFFIC_I2R_INFO: &[u8] = b"ferry traffic i2r";
const TRAFFIC_R2I_INFO: &[u8] = b"ferry traffic r2i";

/// Result of a completed handshake.
pub struct HandshakeOutcome {
    /// Identity key the remote peer proved possession of
    pub remote_identity: VerifyingKey,
    /// Traffic keys oriented for the local side
    pub keys: SessionKeys,
}

/// Key schedule shared by both roles once both ephemeral keys are known.
struct KeySchedule {
    transcript: [u8; 32],
    prk: [u8; 32],
}

impl KeySchedule {
    fn new(
        local: &PrivateKey,
        remote: &PublicKey,
        eph_i: &[u8; 32],
        eph_r: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let transcript = hash_parts(&[PROTOCOL_LABEL, eph_i, eph_r]);
        let shared = local.exchange(remote)?;
        let prk = hkdf_extract(&transcript, shared.as_bytes());
        Ok(Self { transcript, prk })
    }

    fn handshake_key(&self, info: &[u8]) -> AeadKey {
        let mut key = [0u8; 32];
        hkdf_expand(&self.prk, info, &mut key);
        let aead = AeadKey::new(key);
        key.zeroize();
        aead
    }

    fn traffic(&self, info: &[u8]) -> ([u8; 32], [u8; NONCE_SALT_SIZE]) {
        let mut okm = [0u8; 32 + NONCE_SALT_SIZE];
        hkdf_expand(&self.prk, info, &mut okm);
        let mut key = [0u8; 32];
        let mut salt = [0u8; NONCE_SALT_SIZE];
        key.copy_from_slice(&okm[..32]);
        salt.copy_from_slice(&okm[32..]);
        okm.zeroize();
        (key, salt)
    }

    fn session_keys(&self, initiator: bool) -> SessionKeys {
        let (i2r_key, i2r_salt) = self.traffic(TRAFFIC_I2R_INFO);
        let (r2i_key, r2i_salt) = self.traffic(TRAFFIC_R2I_INFO);
        if initiator {
            SessionKeys {
                send_key: i2r_key,
                recv_key: r2i_key,
                send_salt: i2r_salt,
                recv_salt: r2i_salt,
            }
        } else {
            SessionKeys {
                send_key: r2i_key,
                recv_key: i2r_key,
                send_salt: r2i_salt,
                recv_salt: i2r_salt,
            }
        }
    }

    fn seal_proof(
        &self,
        info: &[u8],
        identity: &VerifyingKey,
        signature: &Signature,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = [0u8; ED25519_PUBLIC_KEY_SIZE + ED25519_SIGNATURE_SIZE];
        plaintext[..ED25519_PUBLIC_KEY_SIZE].copy_from_slice(&identity.to_bytes());
        plaintext[ED25519_PUBLIC_KEY_SIZE..].copy_from_slice(signature.as_bytes());
        self.handshake_key(info)
            .encrypt(&handshake_nonce(), &plaintext, &self.transcript)
    }

    fn open_proof(
        &self,
        info: &[u8],
        proof: &[u8],
    ) -> Result<(VerifyingKey, Signature), CryptoError> {
        let plaintext = self
            .handshake_key(info)
            .decrypt(&handshake_nonce(), proof, &self.transcript)?;
        let (identity, signature) = plaintext.split_at(ED25519_PUBLIC_KEY_SIZE);
        let identity: [u8; ED25519_PUBLIC_KEY_SIZE] = identity
            .try_into()
            .map_err(|_| CryptoError::InvalidMessage("identity proof truncated".into()))?;
        Ok((
            VerifyingKey::from_bytes(&identity)?,
            Signature::from_slice(signature)?,
        ))
    }
}

fn handshake_nonce() -> Nonce {
    Nonce::from_counter(0, &[0u8; NONCE_SALT_SIZE])
}

fn check_size(msg: &[u8], expected: usize, which: &str) -> Result<(), CryptoError> {
    if msg.len() != expected {
        return Err(CryptoError::InvalidMessage(format!(
            "{which}: expected {expected} bytes, got {}",
            msg.len()
        )));
    }
    Ok(())
}

fn read_key(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidMessage("truncated ephemeral key".into()))
}

/// Dialing side of the handshake.
pub struct Initiator {
    identity: SigningKey,
    ephemeral: PrivateKey,
}

impl Initiator {
    /// Start a handshake with a fresh ephemeral key.
    pub fn new<R: RngCore + CryptoRng>(identity: &SigningKey, rng: &mut R) -> Self {
        Self {
            identity: identity.clone(),
            ephemeral: PrivateKey::generate(rng),
        }
    }

    /// Produce the first message body.
    #[must_use]
    pub fn write_message_1(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(MESSAGE_1_SIZE);
        msg.push(HANDSHAKE_VERSION);
        msg.extend_from_slice(self.ephemeral.public_key().as_bytes());
        msg
    }

    /// Consume the responder's reply and produce the third message body.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidMessage`] / [`CryptoError::InvalidPublicKey`]
    ///   for a malformed message
    /// - [`CryptoError::LowOrderPoint`] for a degenerate ephemeral key
    /// - [`CryptoError::DecryptionFailed`] / [`CryptoError::InvalidSignature`]
    ///   when the responder fails to authenticate
    pub fn read_message_2(self, msg: &[u8]) -> Result<(Vec<u8>, HandshakeOutcome), CryptoError> {
        check_size(msg, MESSAGE_2_SIZE, "message 2")?;
        let (eph_r, proof) = msg.split_at(X25519_PUBLIC_KEY_SIZE);
        let eph_r = read_key(eph_r)?;
        let eph_i = self.ephemeral.public_key().to_bytes();

        let schedule =
            KeySchedule::new(&self.ephemeral, &PublicKey::from_bytes(eph_r), &eph_i, &eph_r)?;

        let (remote_identity, sig_r) = schedule.open_proof(HS_RESPONDER_INFO, proof)?;
        let mut signed = Vec::with_capacity(RESPONDER_SIG_LABEL.len() + 32);
        signed.extend_from_slice(RESPONDER_SIG_LABEL);
        signed.extend_from_slice(&schedule.transcript);
        remote_identity.verify(&signed, &sig_r)?;

        let mut to_sign = Vec::with_capacity(INITIATOR_SIG_LABEL.len() + 64);
        to_sign.extend_from_slice(INITIATOR_SIG_LABEL);
        to_sign.extend_from_slice(&schedule.transcript);
        to_sign.extend_from_slice(&remote_identity.to_bytes());
        let sig_i = self.identity.sign(&to_sign);

        let msg3 = schedule.seal_proof(HS_INITIATOR_INFO, &self.identity.verifying_key(), &sig_i)?;

        Ok((
            msg3,
            HandshakeOutcome {
                remote_identity,
                keys: schedule.session_keys(true),
            },
        ))
    }
}

/// Listening side of the handshake.
pub struct Responder {
    identity: SigningKey,
}

impl Responder {
    /// Prepare to answer a handshake.
    #[must_use]
    pub fn new(identity: &SigningKey) -> Self {
        Self {
            identity: identity.clone(),
        }
    }

    /// Consume the first message and produce the second message body.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidMessage`] for a wrong size or version
    /// - [`CryptoError::LowOrderPoint`] for a degenerate ephemeral key
    pub fn read_message_1<R: RngCore + CryptoRng>(
        self,
        msg: &[u8],
        rng: &mut R,
    ) -> Result<(Vec<u8>, AwaitingConfirmation), CryptoError> {
        check_size(msg, MESSAGE_1_SIZE, "message 1")?;
        if msg[0] != HANDSHAKE_VERSION {
            return Err(CryptoError::InvalidMessage(format!(
                "unsupported handshake version {}",
                msg[0]
            )));
        }
        let eph_i = read_key(&msg[1..])?;

        let ephemeral = PrivateKey::generate(rng);
        let eph_r = ephemeral.public_key().to_bytes();
        let schedule = KeySchedule::new(&ephemeral, &PublicKey::from_bytes(eph_i), &eph_i, &eph_r)?;

        let mut to_sign = Vec::with_capacity(RESPONDER_SIG_LABEL.len() + 32);
        to_sign.extend_from_slice(RESPONDER_SIG_LABEL);
        to_sign.extend_from_slice(&schedule.transcript);
        let local_identity = self.identity.verifying_key();
        let sig_r = self.identity.sign(&to_sign);

        let proof = schedule.seal_proof(HS_RESPONDER_INFO, &local_identity, &sig_r)?;
        let mut msg2 = Vec::with_capacity(MESSAGE_2_SIZE);
        msg2.extend_from_slice(&eph_r);
        msg2.extend_from_slice(&proof);

        Ok((
            msg2,
            AwaitingConfirmation {
                local_identity,
                schedule,
            },
        ))
    }
}

/// Responder state after sending the second message.
pub struct AwaitingConfirmation {
    local_identity: VerifyingKey,
    schedule: KeySchedule,
}

impl AwaitingConfirmation {
    /// Consume the initiator's proof and finish the handshake.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidMessage`] / [`CryptoError::InvalidPublicKey`]
    ///   for a malformed message
    /// - [`CryptoError::DecryptionFailed`] / [`CryptoError::InvalidSignature`]
    ///   when the initiator fails to authenticate
    pub fn read_message_3(self, msg: &[u8]) -> Result<HandshakeOutcome, CryptoError> {
        check_size(msg, MESSAGE_3_SIZE, "message 3")?;
        let (remote_identity, sig_i) = self.schedule.open_proof(HS_INITIATOR_INFO, msg)?;

        let mut signed = Vec::with_capacity(INITIATOR_SIG_LABEL.len() + 64);
        signed.extend_from_slice(INITIATOR_SIG_LABEL);
        signed.extend_from_slice(&self.schedule.transcript);
        signed.extend_from_slice(&self.local_identity.to_bytes());
        remote_identity.verify(&signed, &sig_i)?;

        Ok(HandshakeOutcome {
            remote_identity,
            keys: self.schedule.session_keys(false),
        })
    }
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.prk.zeroize();
    }
}
