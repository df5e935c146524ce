//! Transport trait abstraction for multiple byte-stream backends.
//!
//! A transport turns a [`Multiaddr`] into a reliable, ordered, bidirectional
//! byte stream and nothing more. Everything above that (security,
//! multiplexing, protocol negotiation) is layered on by the upgrader, so a
//! new backend only has to implement [`Transport`] and [`Listener`].

use crate::multiaddr::Multiaddr;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No transport understands this address
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Dial did not complete in time
    #[error("Dial timed out")]
    Timeout,

    /// Name resolution produced no usable address
    #[error("Failed to resolve {0}")]
    ResolveFailed(String),

    /// WebSocket upgrade was refused or malformed
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    /// Listener is closed
    #[error("Transport is closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A raw, unauthenticated, bidirectional byte stream.
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawConnection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased raw connection as handed to the upgrader.
pub type BoxedConnection = Box<dyn RawConnection>;

/// Async transport trait for establishing raw connections.
///
/// # Examples
///
/// ```no_run
/// use ferry_transport::{Multiaddr, TcpTransport, Transport, TransportConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new(TransportConfig::default());
/// let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9999".parse()?;
/// let conn = transport.dial(&addr).await?;
/// # drop(conn);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs (`tcp`, `ws`).
    fn name(&self) -> &'static str;

    /// Whether this transport can dial or listen on `addr`.
    fn can_handle(&self, addr: &Multiaddr) -> bool;

    /// Open a raw connection to `addr`.
    ///
    /// # Errors
    /// Returns `TransportError` if the address is unsupported, unreachable
    /// or the dial does not complete within the configured timeout.
    async fn dial(&self, addr: &Multiaddr) -> TransportResult<BoxedConnection>;

    /// Start accepting raw connections on `addr`.
    ///
    /// # Errors
    /// Returns `TransportError` if the address is unsupported or binding fails.
    async fn listen(&self, addr: &Multiaddr) -> TransportResult<Box<dyn Listener>>;
}

/// Accepting side of a transport.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound raw connection.
    ///
    /// Returns the connection and the remote address in this transport's
    /// multiaddress form.
    ///
    /// # Errors
    /// Returns `TransportError` if accepting fails.
    async fn accept(&mut self) -> TransportResult<(BoxedConnection, Multiaddr)>;

    /// Address actually bound (port 0 resolved).
    fn local_addr(&self) -> Multiaddr;
}
