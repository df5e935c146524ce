//! Two-node test fixture for integration testing
//!
//! Provides a reusable test infrastructure for two-node scenarios:
//! - A listening node serving its registered handlers
//! - A dialing node with its own identity
//! - Upgraded connection pairs over in-memory pipes
//!
//! # Example
//!
//! ```no_run
//! use ferry_integration_tests::fixtures::{TwoNodeFixture, WireTransport};
//! use ferry_core::app::Exchange;
//!
//! # async fn example() -> ferry_core::Result<()> {
//! let fixture = TwoNodeFixture::new(WireTransport::WebSocket).await?;
//! let (_conn, stream) = fixture.dial_app().await?;
//! let responses = Exchange::start(stream, b"hey", &fixture.client.config().exchange).await?;
//! assert_eq!(responses.collect_all().await?, vec![b"hey".to_vec()]);
//! fixture.cleanup().await;
//! # Ok(())
//! # }
//! ```

use ferry_core::{
    Identity, Multiaddr, Node, NodeConfig, ProtocolId, Result, Stream, UpgradedConnection,
    Upgrader,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Application protocol the fixture's server answers with echo
pub const APP_PROTOCOL: &str = "/app/1.0.0";

/// Pipe capacity for in-memory connection pairs
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Raw transport the fixture listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTransport {
    /// Plain TCP
    Tcp,
    /// WebSocket over TCP
    WebSocket,
}

impl WireTransport {
    fn listen_addr(self) -> Multiaddr {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        Multiaddr::from_socket_addr(loopback, self == Self::WebSocket)
    }
}

/// Two-node test fixture
///
/// The server listens on an ephemeral loopback port and serves every
/// connection on a background task until the fixture is dropped.
pub struct TwoNodeFixture {
    /// Listening node
    pub server: Node,
    /// Dialing node
    pub client: Node,
    /// Server address including its `/p2p/<id>`
    pub server_addr: Multiaddr,
    serve_task: JoinHandle<Result<()>>,
}

impl TwoNodeFixture {
    /// Create a fixture with default configurations and the echo handler
    /// registered for [`APP_PROTOCOL`].
    ///
    /// # Errors
    ///
    /// Returns the listen error if the loopback port cannot be bound.
    pub async fn new(transport: WireTransport) -> Result<Self> {
        let config = NodeConfig::default().with_echo(Self::app_protocol());
        Self::with_configs(transport, config.clone(), config).await
    }

    /// Create a fixture with custom configurations
    ///
    /// # Errors
    ///
    /// Returns [`ferry_core::Error::InvalidConfig`] for a bad configuration,
    /// or the listen error.
    pub async fn with_configs(
        transport: WireTransport,
        server_config: NodeConfig,
        client_config: NodeConfig,
    ) -> Result<Self> {
        let server = Node::new(Identity::generate(), server_config)?;
        let client = Node::new(Identity::generate(), client_config)?;

        let listener = server.listen(&transport.listen_addr()).await?;
        let server_addr = listener.p2p_addr();
        let serve_task = tokio::spawn(listener.serve());

        tracing::debug!("Fixture server listening on {}", server_addr);
        Ok(Self {
            server,
            client,
            server_addr,
            serve_task,
        })
    }

    /// The echo protocol id
    #[must_use]
    pub fn app_protocol() -> ProtocolId {
        ProtocolId::from_static(APP_PROTOCOL)
    }

    /// Dial the server
    ///
    /// # Errors
    ///
    /// Any dial or upgrade error.
    pub async fn dial(&self) -> Result<UpgradedConnection> {
        self.client.dial(&self.server_addr).await
    }

    /// Dial the server and open one stream on [`APP_PROTOCOL`]
    ///
    /// # Errors
    ///
    /// Any dial, upgrade or negotiation error.
    pub async fn dial_app(&self) -> Result<(UpgradedConnection, Stream)> {
        self.client
            .dial_protocol(&self.server_addr, &Self::app_protocol())
            .await
    }

    /// Stop the server
    pub async fn cleanup(mut self) {
        self.serve_task.abort();
        let _ = (&mut self.serve_task).await;
    }
}

impl Drop for TwoNodeFixture {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

/// Upgrade both ends of an in-memory pipe.
///
/// Returns `(dialer, listener)`. `wrap` is applied to the dialer's end of
/// the pipe before the upgrade starts.
///
/// # Errors
///
/// Returns the first upgrade error of either side.
pub async fn upgraded_pair<T, F>(
    dialer: Identity,
    listener: Identity,
    config: NodeConfig,
    wrap: F,
) -> Result<(UpgradedConnection, UpgradedConnection)>
where
    T: ferry_transport::RawConnection,
    F: FnOnce(tokio::io::DuplexStream) -> T,
{
    let config = Arc::new(config);
    let expected = listener.peer_id();
    let dialer = Upgrader::new(Arc::new(dialer), Arc::clone(&config));
    let listener = Upgrader::new(Arc::new(listener), config);

    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let local = Multiaddr::from_socket_addr(SocketAddr::from(([127, 0, 0, 1], 1)), false);

    let (outbound, inbound) = tokio::join!(
        dialer.upgrade_raw_outbound(wrap(a), local.clone(), Some(expected)),
        listener.upgrade_inbound(b, local),
    );
    Ok((outbound?, inbound?))
}
