//! # Ferry Core
//!
//! Connection upgrade stack for the Ferry peer-to-peer dialer.
//!
//! A raw byte stream from `ferry-transport` is upgraded in four steps:
//!
//! ```text
//! raw connection
//!   └─ multistream-select  → /ferry-sigdh/1.0.0
//!        └─ secure session (signed X25519 + XChaCha20-Poly1305)
//!             └─ multistream-select → /mplex/6.7.0
//!                  └─ multiplexer ── stream ── multistream-select → /app/1.0.0
//!                                 ├─ stream ── ...
//!                                 └─ stream ── ...
//! ```
//!
//! This crate provides:
//! - Length-prefixed framing ([`framed`])
//! - Protocol negotiation ([`negotiate`])
//! - The authenticated secure channel ([`secure`])
//! - Stream multiplexing with half-close and per-stream backpressure ([`mux`])
//! - The upgrade pipeline and upgraded connections ([`upgrade`], [`connection`])
//! - Application handlers: echo exchange and ping ([`app`]), identify ([`identify`])
//! - The [`Node`] that ties identity, configuration and transports together
//!
//! ## Example
//!
//! ```no_run
//! use ferry_core::{Identity, Node, NodeConfig, ProtocolId};
//! use ferry_core::app::Exchange;
//!
//! # async fn example() -> ferry_core::Result<()> {
//! let node = Node::new(Identity::generate(), NodeConfig::default())?;
//! let addr: ferry_core::Multiaddr = "/ip4/127.0.0.1/tcp/9999/ws".parse()?;
//! let protocol = ProtocolId::new("/app/1.0.0")?;
//!
//! let (_conn, stream) = node.dial_protocol(&addr, &protocol).await?;
//! let mut responses = Exchange::start(stream, b"hey", &node.config().exchange).await?;
//! while let Some(payload) = responses.next().await {
//!     println!("{}", String::from_utf8_lossy(&payload?));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod framed;
pub mod identify;
pub mod identity;
pub mod mux;
pub mod negotiate;
pub mod node;
pub mod secure;
pub mod upgrade;

pub use config::{
    ExchangeConfig, MuxConfig, NegotiationConfig, NodeConfig, SecurityConfig, TransportConfig,
};
pub use connection::{Endpoint, InboundStream, UpgradedConnection};
pub use error::{Error, FrameError, MultiplexError, NegotiationError, Result, SecurityError};
pub use identify::IdentifyInfo;
pub use identity::{Identity, PeerId};
pub use mux::{Stream, StreamState};
pub use negotiate::ProtocolId;
pub use node::{Node, NodeListener};
pub use upgrade::Upgrader;

pub use ferry_transport::{Multiaddr, Protocol};

/// Protocol id of the secure channel
pub const SECURE_PROTOCOL: &str = "/ferry-sigdh/1.0.0";

/// Protocol id of the stream multiplexer
pub const MPLEX_PROTOCOL: &str = "/mplex/6.7.0";

/// Protocol id of the ping handler
pub const PING_PROTOCOL: &str = "/ipfs/ping/1.0.0";

/// Protocol id of the identify handler
pub const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

/// Agent version reported by identify
pub const AGENT_VERSION: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));

/// Application protocol used by the reference dialer
pub const DEFAULT_APP_PROTOCOL: &str = "/fluence/particle/2.0.0";
