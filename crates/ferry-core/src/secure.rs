//! Secure channel (`/ferry-sigdh/1.0.0`).
//!
//! Runs the three-message signed key exchange from
//! [`ferry_crypto::handshake`] over a raw connection, then wraps the
//! connection in [`SecureSession`], which encrypts everything written and
//! authenticates everything read.
//!
//! Wire format, handshake and traffic alike: `u16 BE len || body`. Traffic
//! bodies are `ciphertext || tag`; the nonce is a per-direction counter and
//! is never sent. A frame that fails authentication poisons the session:
//! the read that hit it and every later read fail with
//! [`SecurityError::DecryptionFailure`]. No plaintext from such a frame is
//! ever returned.

use crate::config::SecurityConfig;
use crate::error::{Error, Result, SecurityError};
use crate::identity::{Identity, PeerId};
use ferry_crypto::CryptoError;
use ferry_crypto::aead::{CipherState, TAG_SIZE};
use ferry_crypto::handshake::{HandshakeOutcome, Initiator, MESSAGE_2_SIZE, Responder};
use ferry_crypto::signatures::VerifyingKey;
use rand_core::OsRng;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Largest encrypted frame body
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Largest plaintext carried by one frame
pub const MAX_FRAME_PLAINTEXT: usize = MAX_FRAME_LEN - TAG_SIZE;

/// Length prefix size
const LEN_PREFIX: usize = 2;

/// Largest handshake message accepted (the biggest one is message 2)
const MAX_HANDSHAKE_MESSAGE: usize = MESSAGE_2_SIZE;

const READ_CHUNK: usize = 16 * 1024;

/// An authenticated, encrypted byte stream
pub struct SecureSession<T> {
    io: T,
    remote_peer: PeerId,
    remote_key: VerifyingKey,
    sender: CipherState,
    receiver: CipherState,
    /// Ciphertext received but not yet decrypted
    read_raw: Vec<u8>,
    /// Decrypted bytes not yet handed to the reader
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    /// Encrypted frames not yet written to `io`
    out: Vec<u8>,
    out_pos: usize,
    poisoned: bool,
}

impl<T> SecureSession<T> {
    fn new(io: T, outcome: HandshakeOutcome) -> Self {
        let remote_peer = PeerId::from_public_key(&outcome.remote_identity);
        Self {
            io,
            remote_peer,
            remote_key: outcome.remote_identity,
            sender: outcome.keys.sender(),
            receiver: outcome.keys.receiver(),
            read_raw: Vec::new(),
            plaintext: Vec::new(),
            plaintext_pos: 0,
            out: Vec::new(),
            out_pos: 0,
            poisoned: false,
        }
    }

    /// Identifier the remote peer proved during the handshake
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Identity key the remote peer proved during the handshake
    #[must_use]
    pub fn remote_public_key(&self) -> &VerifyingKey {
        &self.remote_key
    }

    /// True once a frame has failed authentication
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Decrypt the next buffered frame into `plaintext`, if a complete one
    /// is present.
    fn decrypt_buffered(&mut self) -> io::Result<bool> {
        if self.read_raw.len() < LEN_PREFIX {
            return Ok(false);
        }
        let len = usize::from(u16::from_be_bytes([self.read_raw[0], self.read_raw[1]]));
        let end = LEN_PREFIX + len;
        if self.read_raw.len() < end {
            return Ok(false);
        }

        let opened = self.receiver.open(&self.read_raw[LEN_PREFIX..end], &[]);
        self.read_raw.drain(..end);
        match opened {
            Ok(plaintext) => {
                self.plaintext = plaintext;
                self.plaintext_pos = 0;
                Ok(true)
            }
            Err(_) => {
                self.poisoned = true;
                tracing::warn!(
                    "Frame from {} failed authentication, closing secure channel",
                    self.remote_peer.short()
                );
                Err(decryption_failure())
            }
        }
    }
}

fn decryption_failure() -> io::Error {
    Error::into_io(io::ErrorKind::InvalidData, SecurityError::DecryptionFailure)
}

impl<T> SecureSession<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_drain_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.out_pos < self.out.len() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.out[self.out_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<T> AsyncRead for SecureSession<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.poisoned {
                return Poll::Ready(Err(decryption_failure()));
            }

            if this.plaintext_pos < this.plaintext.len() {
                let available = &this.plaintext[this.plaintext_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.plaintext_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.decrypt_buffered()? {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.io).poll_read(cx, &mut chunk_buf))?;
            let filled = chunk_buf.filled();
            if filled.is_empty() {
                if this.read_raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a secure frame",
                )));
            }
            this.read_raw.extend_from_slice(filled);
        }
    }
}

impl<T> AsyncWrite for SecureSession<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain_out(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_FRAME_PLAINTEXT);
        let sealed = this.sender.seal(&buf[..n], &[]).map_err(|e| match e {
            CryptoError::NonceOverflow => {
                Error::into_io(io::ErrorKind::Other, SecurityError::NonceOverflow)
            }
            other => io::Error::other(other),
        })?;

        #[allow(clippy::cast_possible_truncation)]
        let len = sealed.len() as u16;
        this.out.extend_from_slice(&len.to_be_bytes());
        this.out.extend_from_slice(&sealed);

        // Start pushing the frame out; what does not fit stays queued for
        // the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain_out(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_out(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_out(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

impl<T> std::fmt::Debug for SecureSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("remote_peer", &self.remote_peer)
            .field("sent", &self.sender.counter())
            .field("received", &self.receiver.counter())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

fn handshake_error(err: CryptoError) -> SecurityError {
    match err {
        CryptoError::DecryptionFailed | CryptoError::InvalidSignature => {
            SecurityError::AuthenticationFailed
        }
        other => SecurityError::MalformedHandshakeMessage(other.to_string()),
    }
}

async fn write_handshake_message<T>(io: &mut T, body: &[u8]) -> Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

async fn read_handshake_message<T>(io: &mut T) -> Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let len = usize::from(io.read_u16().await?);
    if len > MAX_HANDSHAKE_MESSAGE {
        return Err(SecurityError::MalformedHandshakeMessage(format!(
            "handshake message of {len} bytes"
        ))
        .into());
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok(body)
}

async fn run_initiator<T>(
    io: &mut T,
    identity: &Identity,
    expected: Option<PeerId>,
) -> Result<HandshakeOutcome>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let initiator = Initiator::new(identity.signing_key(), &mut OsRng);
    write_handshake_message(io, &initiator.write_message_1()).await?;

    let msg2 = read_handshake_message(io).await?;
    let (msg3, outcome) = initiator.read_message_2(&msg2).map_err(handshake_error)?;

    let actual = PeerId::from_public_key(&outcome.remote_identity);
    if let Some(expected) = expected {
        if expected != actual {
            tracing::warn!(
                "Identity mismatch: dialed {}, remote proved {}",
                expected.short(),
                actual.short()
            );
            return Err(SecurityError::IdentityMismatch { expected, actual }.into());
        }
    }

    write_handshake_message(io, &msg3).await?;
    Ok(outcome)
}

async fn run_responder<T>(io: &mut T, identity: &Identity) -> Result<HandshakeOutcome>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let msg1 = read_handshake_message(io).await?;
    let (msg2, awaiting) = Responder::new(identity.signing_key())
        .read_message_1(&msg1, &mut OsRng)
        .map_err(handshake_error)?;
    write_handshake_message(io, &msg2).await?;

    let msg3 = read_handshake_message(io).await?;
    awaiting
        .read_message_3(&msg3)
        .map_err(|e| handshake_error(e).into())
}

/// Run the handshake as the dialing side.
///
/// When `expected` is given, the handshake fails with
/// [`SecurityError::IdentityMismatch`] before the final message is sent if
/// the responder proves any other identity.
///
/// # Errors
///
/// - [`SecurityError::HandshakeTimeout`] if the exchange exceeds the bound
/// - [`SecurityError::IdentityMismatch`] as described above
/// - [`SecurityError::MalformedHandshakeMessage`] for bad sizes, versions or keys
/// - [`SecurityError::AuthenticationFailed`] for a bad signature or proof
pub async fn secure_outbound<T>(
    mut io: T,
    identity: &Identity,
    expected: Option<PeerId>,
    config: &SecurityConfig,
) -> Result<SecureSession<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = tokio::time::timeout(
        config.handshake_timeout,
        run_initiator(&mut io, identity, expected),
    )
    .await
    .map_err(|_| SecurityError::HandshakeTimeout)??;

    let session = SecureSession::new(io, outcome);
    tracing::debug!("Secure channel established with {}", session.remote_peer());
    Ok(session)
}

/// Run the handshake as the listening side.
///
/// # Errors
///
/// Same as [`secure_outbound`], minus `IdentityMismatch`.
pub async fn secure_inbound<T>(
    mut io: T,
    identity: &Identity,
    config: &SecurityConfig,
) -> Result<SecureSession<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = tokio::time::timeout(config.handshake_timeout, run_responder(&mut io, identity))
        .await
        .map_err(|_| SecurityError::HandshakeTimeout)??;

    let session = SecureSession::new(io, outcome);
    tracing::debug!("Secure channel accepted from {}", session.remote_peer());
    Ok(session)
}
