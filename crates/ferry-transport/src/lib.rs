//! # Ferry Transport
//!
//! Byte-stream transports for the Ferry network stack.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) / [`Listener`](transport::Listener)
//!   abstraction the upgrade pipeline consumes
//! - Plain TCP (`/ip4/.../tcp/<port>`)
//! - WebSocket over TCP (`/ip4/.../tcp/<port>/ws`, RFC 6455 binary frames)
//! - Multiaddresses with string and binary encodings
//!
//! Transports only move bytes; encryption, multiplexing and protocol
//! negotiation happen in `ferry-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod multiaddr;
pub mod tcp;
pub mod transport;
pub mod varint;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

pub use multiaddr::{Multiaddr, MultiaddrError, Protocol};
pub use tcp::TcpTransport;
pub use transport::{
    BoxedConnection, Listener, RawConnection, Transport, TransportError, TransportResult,
};
pub use websocket::WsTransport;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Disable Nagle's algorithm on TCP sockets
    pub nodelay: bool,
    /// Upper bound on establishing the raw connection (connect + WebSocket upgrade)
    pub dial_timeout: Duration,
    /// Largest WebSocket frame payload accepted from the remote
    pub max_ws_frame: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            dial_timeout: Duration::from_secs(30),
            max_ws_frame: 4 * 1024 * 1024,
        }
    }
}

/// Build the standard transport set: WebSocket first, then plain TCP.
///
/// Order matters: the first transport whose [`Transport::can_handle`]
/// accepts an address wins.
#[must_use]
pub fn default_transports(config: &TransportConfig) -> Vec<Arc<dyn Transport>> {
    vec![
        Arc::new(WsTransport::new(config.clone())),
        Arc::new(TcpTransport::new(config.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert!(config.nodelay);
        assert_eq!(config.dial_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_default_transport_selection() {
        let transports = default_transports(&TransportConfig::default());
        let ws: Multiaddr = "/ip4/127.0.0.1/tcp/9999/ws".parse().unwrap();
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/9999".parse().unwrap();

        let pick = |addr: &Multiaddr| {
            transports
                .iter()
                .find(|t| t.can_handle(addr))
                .map(|t| t.name())
        };

        assert_eq!(pick(&ws), Some("ws"));
        assert_eq!(pick(&tcp), Some("tcp"));
    }
}
