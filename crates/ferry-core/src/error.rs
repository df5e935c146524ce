//! Error types for the upgrade stack
//!
//! Errors are grouped by the layer that produced them, so callers can decide
//! what a failure costs:
//!
//! - **Transport**: connect/accept/I/O failures. Fatal to one connection.
//! - **Negotiation**: no common protocol or a timeout. The attempted upgrade
//!   or stream is abandoned; retrying with other parameters is safe.
//! - **Security**: handshake or decryption failures. Always fatal to the
//!   connection; nothing ever falls back to plaintext.
//! - **Multiplex**: stream or connection closed, malformed frames. Fatal to
//!   the affected stream, except a malformed frame, which kills the
//!   connection.
//!
//! Errors that cross `AsyncRead`/`AsyncWrite` boundaries travel inside
//! [`std::io::Error`]; `Error::from(io::Error)` recovers the typed error.

use crate::identity::PeerId;
use ferry_transport::{MultiaddrError, TransportError};
use ferry_transport::varint::VarintError;
use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Protocol negotiation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// Every proposal was rejected
    #[error("no common protocol")]
    NoCommonProtocol,

    /// The negotiation did not finish within the configured bound
    #[error("protocol negotiation timed out")]
    NegotiationTimeout,

    /// The peer sent something that is not valid multistream-select
    #[error("negotiation protocol violation: {0}")]
    ProtocolViolation(String),

    /// A protocol id failed validation
    #[error("invalid protocol id: {0:?}")]
    InvalidProtocolId(String),
}

/// Secure channel failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// Handshake did not finish within the configured bound
    #[error("secure handshake timed out")]
    HandshakeTimeout,

    /// The peer proved an identity other than the one dialed
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Peer we expected
        expected: PeerId,
        /// Peer that authenticated
        actual: PeerId,
    },

    /// Handshake message with a bad size, version or key
    #[error("malformed handshake message: {0}")]
    MalformedHandshakeMessage(String),

    /// Bad signature or undecryptable handshake payload
    #[error("handshake authentication failed")]
    AuthenticationFailed,

    /// A post-handshake frame failed authentication
    #[error("decryption failure: frame failed authentication")]
    DecryptionFailure,

    /// Send counter exhausted
    #[error("nonce counter exhausted")]
    NonceOverflow,
}

/// Stream multiplexer failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiplexError {
    /// The stream was closed locally
    #[error("stream closed")]
    StreamClosed,

    /// The stream was reset by either side
    #[error("stream reset")]
    StreamReset,

    /// The underlying connection is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be parsed; framing state is lost
    #[error("malformed mux frame: {0}")]
    MalformedFrame(String),

    /// Concurrent stream limit reached
    #[error("too many streams (limit {0})")]
    TooManyStreams(usize),
}

/// Length-prefixed framing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Clean end of stream at a frame boundary
    #[error("connection closed")]
    ConnectionClosed,

    /// End of stream inside a frame
    #[error("incomplete frame: {buffered} bytes buffered")]
    IncompleteFrame {
        /// Bytes of the partial frame
        buffered: usize,
    },

    /// Frame above the configured limit
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Announced or attempted length
        len: u64,
        /// Configured limit
        max: usize,
    },

    /// Length prefix is not a valid varint
    #[error("invalid length prefix: {0}")]
    InvalidLength(#[from] VarintError),
}

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Negotiation failure
    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Secure channel failure
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Multiplexer failure
    #[error("multiplex error: {0}")]
    Multiplex(#[from] MultiplexError),

    /// Framing failure
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Address parse failure
    #[error("address error: {0}")]
    Address(#[from] MultiaddrError),

    /// No frame arrived within the response timeout
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// A response sequence failed after some payloads had arrived
    #[error("response cut short after {} payloads: {source}", .received.len())]
    PartialResponse {
        /// Payloads received before the failure, in order
        received: Vec<Vec<u8>>,
        /// What ended the sequence
        source: Box<Error>,
    },

    /// Ping reply did not match the request
    #[error("ping payload mismatch")]
    PingMismatch,

    /// Identify record could not be parsed
    #[error("malformed identify record: {0}")]
    MalformedIdentify(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid identity material
    #[error("invalid identity: {0}")]
    InvalidIdentity(Cow<'static, str>),

    /// Unclassified I/O failure
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Returns true if the connection this error occurred on cannot be used anymore
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Security(_)
                | Error::Transport(_)
                | Error::Io(_)
                | Error::Multiplex(MultiplexError::ConnectionClosed | MultiplexError::MalformedFrame(_))
        )
    }

    /// Returns true if retrying (possibly with other parameters) may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Negotiation(_)
                | Error::ResponseTimeout(_)
                | Error::PartialResponse { .. }
                | Error::Transport(TransportError::Timeout | TransportError::ConnectionFailed(_))
        )
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }

    /// Wrap a typed error so it can cross an `AsyncRead`/`AsyncWrite` boundary.
    pub(crate) fn into_io<E>(kind: io::ErrorKind, err: E) -> io::Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        io::Error::new(kind, err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(inner) = err.get_ref() {
            if let Some(e) = inner.downcast_ref::<SecurityError>() {
                return Error::Security(e.clone());
            }
            if let Some(e) = inner.downcast_ref::<MultiplexError>() {
                return Error::Multiplex(e.clone());
            }
            if let Some(e) = inner.downcast_ref::<FrameError>() {
                return Error::Frame(e.clone());
            }
        }
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Security(e) => Error::into_io(io::ErrorKind::InvalidData, e),
            Error::Multiplex(e) => {
                let kind = match e {
                    MultiplexError::ConnectionClosed => io::ErrorKind::ConnectionAborted,
                    MultiplexError::StreamReset => io::ErrorKind::ConnectionReset,
                    MultiplexError::StreamClosed => io::ErrorKind::BrokenPipe,
                    _ => io::ErrorKind::InvalidData,
                };
                Error::into_io(kind, e)
            }
            Error::Frame(e) => Error::into_io(io::ErrorKind::InvalidData, e),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_errors_fatal() {
        assert!(Error::Security(SecurityError::DecryptionFailure).is_fatal_to_connection());
        assert!(Error::Security(SecurityError::HandshakeTimeout).is_fatal_to_connection());
        assert!(!Error::Security(SecurityError::AuthenticationFailed).is_retryable());
    }

    #[test]
    fn test_stream_errors_not_fatal() {
        assert!(!Error::Multiplex(MultiplexError::StreamClosed).is_fatal_to_connection());
        assert!(!Error::Multiplex(MultiplexError::StreamReset).is_fatal_to_connection());
        assert!(
            Error::Multiplex(MultiplexError::MalformedFrame("bad flag".into()))
                .is_fatal_to_connection()
        );
    }

    #[test]
    fn test_negotiation_errors_retryable() {
        assert!(Error::Negotiation(NegotiationError::NoCommonProtocol).is_retryable());
        assert!(Error::Negotiation(NegotiationError::NegotiationTimeout).is_retryable());
        assert!(!Error::Negotiation(NegotiationError::NoCommonProtocol).is_fatal_to_connection());
    }

    #[test]
    fn test_io_roundtrip_preserves_typed_error() {
        let io_err: io::Error = Error::Security(SecurityError::DecryptionFailure).into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            Error::from(io_err),
            Error::Security(SecurityError::DecryptionFailure)
        ));

        let io_err: io::Error = Error::Multiplex(MultiplexError::StreamReset).into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionReset);
        assert!(matches!(
            Error::from(io_err),
            Error::Multiplex(MultiplexError::StreamReset)
        ));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = Error::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
