//! Node configuration
//!
//! One [`NodeConfig`] is built at startup and handed by reference to the
//! upgrader, the multiplexer and the application handlers. Nothing in the
//! stack reads process-wide state.

use crate::app::{Handler, ProtocolRegistry};
use crate::error::{Error, Result};
use crate::negotiate::ProtocolId;
use std::time::Duration;

pub use ferry_transport::TransportConfig;

/// Largest mplex payload the wire format allows
const MPLEX_MAX_PAYLOAD: usize = 1024 * 1024;

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Protocol negotiation settings
    pub negotiation: NegotiationConfig,

    /// Secure channel settings
    pub security: SecurityConfig,

    /// Multiplexer settings
    pub mux: MuxConfig,

    /// Transport settings
    pub transport: TransportConfig,

    /// Application exchange settings
    pub exchange: ExchangeConfig,

    /// Protocols served on inbound streams
    pub protocols: ProtocolRegistry,
}

impl NodeConfig {
    /// Check every section for values the stack cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.negotiation.timeout.is_zero() {
            return Err(Error::invalid_config("negotiation timeout must be non-zero"));
        }
        if self.negotiation.max_attempts == 0 {
            return Err(Error::invalid_config("negotiation max_attempts must be at least 1"));
        }
        if self.security.handshake_timeout.is_zero() {
            return Err(Error::invalid_config("handshake timeout must be non-zero"));
        }
        if self.mux.max_frame_len == 0 || self.mux.max_frame_len > MPLEX_MAX_PAYLOAD {
            return Err(Error::invalid_config("mux max_frame_len must be in 1..=1 MiB"));
        }
        if self.mux.max_buffered_frames == 0
            || self.mux.incoming_queue == 0
            || self.mux.outbound_queue == 0
        {
            return Err(Error::invalid_config("mux queue sizes must be non-zero"));
        }
        if self.mux.max_streams == 0 {
            return Err(Error::invalid_config("mux max_streams must be at least 1"));
        }
        if self.transport.dial_timeout.is_zero() {
            return Err(Error::invalid_config("dial timeout must be non-zero"));
        }
        if self.exchange.max_frame_len == 0 {
            return Err(Error::invalid_config("exchange max_frame_len must be non-zero"));
        }
        if self.exchange.response_timeout.is_zero() {
            return Err(Error::invalid_config("response timeout must be non-zero"));
        }
        Ok(())
    }

    /// Register `protocol` to be answered by the echo handler.
    #[must_use]
    pub fn with_echo(mut self, protocol: ProtocolId) -> Self {
        self.protocols.insert(protocol, Handler::Echo);
        self
    }
}

/// Protocol negotiation configuration
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Bound on one complete negotiation
    pub timeout: Duration,

    /// Rejected proposals a listener tolerates before giving up
    pub max_attempts: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 32,
        }
    }
}

/// Secure channel configuration
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Bound on the three-message handshake
    pub handshake_timeout: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest frame payload sent or accepted
    pub max_frame_len: usize,

    /// Frames buffered per stream before the stream is reset
    pub max_buffered_frames: usize,

    /// Remotely opened streams waiting to be accepted
    pub incoming_queue: usize,

    /// Frames waiting for the writer task
    pub outbound_queue: usize,

    /// Concurrently open streams per connection
    pub max_streams: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_len: MPLEX_MAX_PAYLOAD,
            max_buffered_frames: 32,
            incoming_queue: 64,
            outbound_queue: 256,
            max_streams: 256,
        }
    }
}

/// Application exchange configuration
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Largest application frame
    pub max_frame_len: usize,

    /// Bound on each wait for a response frame
    pub response_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 1024 * 1024,
            response_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.negotiation.timeout, Duration::from_secs(10));
        assert_eq!(config.negotiation.max_attempts, 32);
        assert_eq!(config.security.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.mux.max_frame_len, 1024 * 1024);
        assert_eq!(config.mux.max_buffered_frames, 32);
        assert_eq!(config.mux.incoming_queue, 64);
        assert_eq!(config.mux.max_streams, 256);
        assert_eq!(config.exchange.response_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = NodeConfig::default();
        config.negotiation.timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_oversized_mux_frame_rejected() {
        let mut config = NodeConfig::default();
        config.mux.max_frame_len = 2 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_echo_registers_handler() {
        let protocol = ProtocolId::new("/app/1.0.0").unwrap();
        let config = NodeConfig::default().with_echo(protocol.clone());
        assert!(matches!(config.protocols.get(&protocol), Some(Handler::Echo)));
    }
}
