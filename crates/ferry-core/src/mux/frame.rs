//! Mplex wire frames.
//!
//! ```text
//! uvarint(stream_id << 3 | flag) || uvarint(len) || payload
//! ```
//!
//! The flag says what the frame does and which side of the stream sent it:
//! the side that opened the stream is the *initiator*, the other side the
//! *receiver*. Both sides number their own streams independently, so a
//! stream is identified by its id together with that role.

use crate::error::MultiplexError;
use ferry_transport::varint::{self, VarintError};

/// Frame type and sender role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    /// Open a stream (sent by its initiator)
    NewStream = 0,
    /// Data from the receiver
    MessageReceiver = 1,
    /// Data from the initiator
    MessageInitiator = 2,
    /// Receiver closed its write side
    CloseReceiver = 3,
    /// Initiator closed its write side
    CloseInitiator = 4,
    /// Receiver aborted the stream
    ResetReceiver = 5,
    /// Initiator aborted the stream
    ResetInitiator = 6,
}

impl Flag {
    /// Parse the low three header bits
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NewStream),
            1 => Some(Self::MessageReceiver),
            2 => Some(Self::MessageInitiator),
            3 => Some(Self::CloseReceiver),
            4 => Some(Self::CloseInitiator),
            5 => Some(Self::ResetReceiver),
            6 => Some(Self::ResetInitiator),
            _ => None,
        }
    }

    /// True if the frame was sent by the side that opened the stream
    #[must_use]
    pub fn sent_by_initiator(self) -> bool {
        matches!(
            self,
            Self::NewStream | Self::MessageInitiator | Self::CloseInitiator | Self::ResetInitiator
        )
    }

    /// Data flag for a sender in the given role
    #[must_use]
    pub fn message(initiator: bool) -> Self {
        if initiator {
            Self::MessageInitiator
        } else {
            Self::MessageReceiver
        }
    }

    /// Close flag for a sender in the given role
    #[must_use]
    pub fn close(initiator: bool) -> Self {
        if initiator {
            Self::CloseInitiator
        } else {
            Self::CloseReceiver
        }
    }

    /// Reset flag for a sender in the given role
    #[must_use]
    pub fn reset(initiator: bool) -> Self {
        if initiator {
            Self::ResetInitiator
        } else {
            Self::ResetReceiver
        }
    }
}

/// One multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream number, scoped to the initiator
    pub stream_id: u64,
    /// Frame type
    pub flag: Flag,
    /// Payload (stream name for `NewStream`, data for messages, empty otherwise)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame
    #[must_use]
    pub fn new(stream_id: u64, flag: Flag, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            flag,
            payload,
        }
    }

    /// Build a frame with an empty payload
    #[must_use]
    pub fn control(stream_id: u64, flag: Flag) -> Self {
        Self::new(stream_id, flag, Vec::new())
    }

    /// Append the wire encoding to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        varint::encode((self.stream_id << 3) | u64::from(self.flag as u8), out);
        varint::encode(self.payload.len() as u64, out);
        out.extend_from_slice(&self.payload);
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the frame and the bytes consumed, or `None` if `buf` does
    /// not yet hold a complete frame.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::MalformedFrame`] for an invalid varint, an
    /// unknown flag or a payload longer than `max_payload`. Framing state is
    /// lost after any of these.
    pub fn decode(
        buf: &[u8],
        max_payload: usize,
    ) -> Result<Option<(Self, usize)>, MultiplexError> {
        let Some((header, header_len)) = decode_varint(buf)? else {
            return Ok(None);
        };
        let Some((len, len_len)) = decode_varint(&buf[header_len..])? else {
            return Ok(None);
        };

        #[allow(clippy::cast_possible_truncation)]
        let flag = Flag::from_u8((header & 0x07) as u8).ok_or_else(|| {
            MultiplexError::MalformedFrame(format!("unknown flag {}", header & 0x07))
        })?;
        if len > max_payload as u64 {
            return Err(MultiplexError::MalformedFrame(format!(
                "payload of {len} bytes exceeds {max_payload}"
            )));
        }

        let start = header_len + len_len;
        #[allow(clippy::cast_possible_truncation)]
        let end = start + len as usize;
        if buf.len() < end {
            return Ok(None);
        }

        Ok(Some((
            Self::new(header >> 3, flag, buf[start..end].to_vec()),
            end,
        )))
    }
}

fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, MultiplexError> {
    match varint::decode(buf) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(VarintError::Truncated) => Ok(None),
        Err(e) => Err(MultiplexError::MalformedFrame(e.to_string())),
    }
}
