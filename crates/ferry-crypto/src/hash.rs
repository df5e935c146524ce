//! BLAKE3 hashing and key derivation.
//!
//! Provides:
//! - Hashing for transcripts and peer identifiers
//! - HKDF-like extract/expand on top of keyed BLAKE3

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Hash the concatenation of several parts without allocating.
#[must_use]
pub fn hash_parts(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// HKDF-Extract: Extract a pseudorandom key from input key material.
///
/// Corresponds to HKDF-Extract from RFC 5869, but using BLAKE3.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        let salt_hash = hash(salt);
        let mut hasher = blake3::Hasher::new_keyed(&salt_hash);
        hasher.update(ikm);
        *hasher.finalize().as_bytes()
    }
}

/// HKDF-Expand: Expand a pseudorandom key into arbitrary-length output.
///
/// Corresponds to HKDF-Expand from RFC 5869, but using BLAKE3.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);

    let mut reader = hasher.finalize_xof();
    reader.fill(output);
}

/// HKDF: Combined extract-then-expand.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) {
    let prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info, output);
}
