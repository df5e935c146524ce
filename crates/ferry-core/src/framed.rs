//! Length-prefixed framing over a byte stream.
//!
//! Each frame on the wire is `uvarint(len) || payload`. The underlying
//! stream may fragment or coalesce bytes arbitrarily; [`FrameDecoder`]
//! buffers until a complete frame is present, so frame boundaries are
//! preserved end to end.

use crate::error::{Error, FrameError, Result};
use ferry_transport::varint::{self, VarintError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read chunk size for [`Framed`]
const READ_CHUNK: usize = 8 * 1024;

/// Sans-I/O frame decoder: push bytes in, pop complete frames out
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames longer than `max_len`
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] as soon as the length prefix
    /// announces more than the limit, and [`FrameError::InvalidLength`]
    /// for an overlong or overflowing prefix. Both leave the decoder
    /// unusable.
    pub fn next_frame(&mut self) -> std::result::Result<Option<Vec<u8>>, FrameError> {
        let (len, prefix) = match varint::decode(&self.buf) {
            Ok(decoded) => decoded,
            Err(VarintError::Truncated) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len > self.max_len as u64 {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_len,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let end = prefix + len as usize;
        if self.buf.len() < end {
            return Ok(None);
        }

        let payload = self.buf[prefix..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(payload))
    }
}

/// Encode one frame into `out`.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(varint::encoded_len(payload.len() as u64) + payload.len());
    varint::encode(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

/// Write one frame with a single `write_all` so it is never interleaved.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if `payload` exceeds `max_len`, or the
/// underlying write error.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len {
        return Err(FrameError::TooLarge {
            len: payload.len() as u64,
            max: max_len,
        }
        .into());
    }

    let mut buf = Vec::new();
    encode_frame(payload, &mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// A byte stream read and written as length-prefixed frames
#[derive(Debug)]
pub struct Framed<T> {
    io: T,
    decoder: FrameDecoder,
}

impl<T> Framed<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap `io`, accepting frames up to `max_len` bytes
    pub fn new(io: T, max_len: usize) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(max_len),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// # Errors
    ///
    /// - [`FrameError::ConnectionClosed`] on end of stream at a frame boundary
    /// - [`FrameError::IncompleteFrame`] on end of stream inside a frame
    /// - [`FrameError::TooLarge`] / [`FrameError::InvalidLength`] for a bad prefix
    /// - whatever the underlying stream reports (typed errors such as
    ///   `DecryptionFailure` or `StreamReset` are recovered from `io::Error`)
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }

            let n = self.io.read(&mut chunk).await.map_err(Error::from)?;
            if n == 0 {
                let buffered = self.decoder.buffered();
                return Err(if buffered == 0 {
                    FrameError::ConnectionClosed
                } else {
                    FrameError::IncompleteFrame { buffered }
                }
                .into());
            }
            self.decoder.push(&chunk[..n]);
        }
    }

    /// Write one frame
    ///
    /// # Errors
    ///
    /// See [`write_frame`].
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let max_len = self.decoder.max_len;
        write_frame(&mut self.io, payload, max_len).await
    }

    /// Half-close the write side of the underlying stream
    ///
    /// # Errors
    ///
    /// Returns the underlying shutdown error.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await.map_err(Error::from)
    }

    /// Mutable access to the underlying stream
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Unwrap the underlying stream. Buffered bytes that did not form a
    /// complete frame are discarded.
    pub fn into_inner(self) -> T {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ====================================================================
    // FrameDecoder
    // ====================================================================

    #[test]
    fn test_decoder_single_frame() {
        let mut wire = Vec::new();
        encode_frame(b"hey", &mut wire);
        assert_eq!(wire, [3, b'h', b'e', b'y']);

        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&wire);
        assert_eq!(decoder.next_frame().unwrap(), Some(b"hey".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let mut wire = Vec::new();
        encode_frame(&[0xAB; 300], &mut wire);
        encode_frame(b"", &mut wire);
        encode_frame(b"tail", &mut wire);

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for byte in wire {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![vec![0xAB; 300], Vec::new(), b"tail".to_vec()]);
    }

    #[test]
    fn test_decoder_too_large() {
        let mut wire = Vec::new();
        encode_frame(&[0u8; 65], &mut wire);

        let mut decoder = FrameDecoder::new(64);
        decoder.push(&wire[..2]);
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len: 65, max: 64 })
        );
    }

    #[test]
    fn test_decoder_overlong_prefix() {
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&[0x80, 0x00]);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::InvalidLength(VarintError::NotMinimal))
        ));
    }

    // ====================================================================
    // Framed
    // ====================================================================

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let (a, b) = tokio::io::duplex(16);
        let mut a = Framed::new(a, 1024);
        let mut b = Framed::new(b, 1024);

        let writer = tokio::spawn(async move {
            a.write_frame(b"first").await.unwrap();
            a.write_frame(&[7u8; 200]).await.unwrap();
            a.shutdown().await.unwrap();
        });

        assert_eq!(b.read_frame().await.unwrap(), b"first");
        assert_eq!(b.read_frame().await.unwrap(), vec![7u8; 200]);
        assert!(matches!(
            b.read_frame().await,
            Err(Error::Frame(FrameError::ConnectionClosed))
        ));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_framed_incomplete_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut b = Framed::new(b, 1024);

        a.write_all(&[10, 1, 2, 3]).await.unwrap();
        drop(a);

        assert!(matches!(
            b.read_frame().await,
            Err(Error::Frame(FrameError::IncompleteFrame { buffered: 4 }))
        ));
    }

    #[tokio::test]
    async fn test_write_frame_too_large() {
        let (a, _b) = tokio::io::duplex(64);
        let mut a = Framed::new(a, 4);
        assert!(matches!(
            a.write_frame(b"too long").await,
            Err(Error::Frame(FrameError::TooLarge { len: 8, max: 4 }))
        ));
    }
}
