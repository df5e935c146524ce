//! Unsigned LEB128 varints (multiformats `uvarint`).
//!
//! Used for multiaddress codes, frame length prefixes, negotiation messages
//! and multiplexer headers. Encodings are limited to 9 bytes (63 bits) and
//! must be minimal.

use thiserror::Error;

/// Longest accepted encoding
pub const MAX_VARINT_LEN: usize = 9;

/// Varint decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarintError {
    /// Input ended in the middle of a varint
    #[error("truncated varint")]
    Truncated,

    /// Encoding longer than 9 bytes
    #[error("varint overflow")]
    Overflow,

    /// Encoding is not minimal (trailing zero group)
    #[error("non-minimal varint encoding")]
    NotMinimal,
}

/// Append the encoding of `value` to `out`.
///
/// Values at or above 2^63 do not fit the 9-byte limit and will not decode.
pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Number of bytes `value` encodes to.
#[must_use]
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode a varint from the front of `input`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// - [`VarintError::Truncated`] if `input` ends before the last byte
/// - [`VarintError::Overflow`] for encodings longer than 9 bytes
/// - [`VarintError::NotMinimal`] for overlong encodings
pub fn decode(input: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value = 0u64;
    for (i, &byte) in input.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(VarintError::Overflow);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            if byte == 0 && i > 0 {
                return Err(VarintError::NotMinimal);
            }
            return Ok((value, i + 1));
        }
    }
    if input.len() >= MAX_VARINT_LEN {
        Err(VarintError::Overflow)
    } else {
        Err(VarintError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode(value, &mut out);
        out
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(enc(0), vec![0x00]);
        assert_eq!(enc(1), vec![0x01]);
        assert_eq!(enc(127), vec![0x7F]);
        assert_eq!(enc(128), vec![0x80, 0x01]);
        assert_eq!(enc(300), vec![0xAC, 0x02]);
        assert_eq!(enc(16384), vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn test_encoded_len_matches() {
        for value in [0, 1, 127, 128, 16383, 16384, u64::from(u32::MAX), (1 << 63) - 1] {
            assert_eq!(encoded_len(value), enc(value).len(), "value {value}");
        }
    }

    #[test]
    fn test_decode_reports_consumed() {
        let mut buf = enc(300);
        buf.extend_from_slice(b"rest");
        assert_eq!(decode(&buf), Ok((300, 2)));
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode(&[]), Err(VarintError::Truncated));
        assert_eq!(decode(&[0x80]), Err(VarintError::Truncated));
    }

    #[test]
    fn test_decode_rejects_non_minimal() {
        assert_eq!(decode(&[0x81, 0x00]), Err(VarintError::NotMinimal));
    }

    #[test]
    fn test_decode_rejects_overflow() {
        assert_eq!(decode(&[0xFF; 10]), Err(VarintError::Overflow));
        assert_eq!(decode(&[0xFF; 9]), Err(VarintError::Overflow));
    }

    #[test]
    fn test_max_nine_byte_value() {
        let max = (1u64 << 63) - 1;
        let buf = enc(max);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(decode(&buf), Ok((max, MAX_VARINT_LEN)));
    }
}
