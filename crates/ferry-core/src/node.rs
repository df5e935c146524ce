//! Node - identity, configuration and transports in one handle
//!
//! # Example
//!
//! ```no_run
//! use ferry_core::{Identity, Multiaddr, Node, NodeConfig, ProtocolId};
//!
//! # async fn example() -> ferry_core::Result<()> {
//! let protocol = ProtocolId::new("/app/1.0.0")?;
//! let config = NodeConfig::default().with_echo(protocol);
//! let node = Node::new(Identity::generate(), config)?;
//!
//! let addr: Multiaddr = "/ip4/0.0.0.0/tcp/9999/ws".parse()?;
//! let listener = node.listen(&addr).await?;
//! listener.serve().await
//! # }
//! ```

use crate::app;
use crate::config::NodeConfig;
use crate::connection::UpgradedConnection;
use crate::error::Result;
use crate::identify::{self, IdentifyInfo};
use crate::identity::{Identity, PeerId};
use crate::mux::Stream;
use crate::negotiate::ProtocolId;
use crate::upgrade::Upgrader;
use ferry_transport::{Listener, Multiaddr, Protocol, Transport};
use std::sync::Arc;
use std::time::Duration;

/// Ferry node
///
/// Cheap to clone; clones share identity, configuration and transports.
#[derive(Clone, Debug)]
pub struct Node {
    upgrader: Arc<Upgrader>,
}

impl Node {
    /// Create a node with the standard transports.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if `config` fails validation.
    pub fn new(identity: Identity, config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let upgrader = Upgrader::new(Arc::new(identity), Arc::new(config));
        tracing::debug!("Node {} created", upgrader.identity().peer_id());
        Ok(Self {
            upgrader: Arc::new(upgrader),
        })
    }

    /// Create a node with an explicit transport list.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfig`] if `config` fails validation.
    pub fn with_transports(
        identity: Identity,
        config: NodeConfig,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self> {
        config.validate()?;
        let upgrader = Upgrader::with_transports(Arc::new(identity), Arc::new(config), transports);
        Ok(Self {
            upgrader: Arc::new(upgrader),
        })
    }

    /// This node's peer id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.upgrader.identity().peer_id()
    }

    /// This node's identity
    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.upgrader.identity()
    }

    /// Configuration the node was built with
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        self.upgrader.config()
    }

    /// Dial `addr` and upgrade the connection. A trailing `/p2p/<id>` is
    /// verified against the identity the remote proves.
    ///
    /// # Errors
    ///
    /// Any transport, negotiation or security error.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<UpgradedConnection> {
        self.upgrader.upgrade_outbound(addr, None).await
    }

    /// Dial `addr` and open one stream negotiated to `protocol`.
    ///
    /// # Errors
    ///
    /// See [`Node::dial`] and [`UpgradedConnection::open_stream`].
    pub async fn dial_protocol(
        &self,
        addr: &Multiaddr,
        protocol: &ProtocolId,
    ) -> Result<(UpgradedConnection, Stream)> {
        let conn = self.dial(addr).await?;
        let stream = conn.open_stream(protocol).await?;
        Ok((conn, stream))
    }

    /// Dial `addr` and ping it `count` times over one stream.
    ///
    /// # Errors
    ///
    /// See [`Node::dial_protocol`] and [`app::ping`].
    pub async fn ping(&self, addr: &Multiaddr, count: usize) -> Result<Vec<Duration>> {
        let protocol = ProtocolId::from_static(crate::PING_PROTOCOL);
        let (conn, mut stream) = self.dial_protocol(addr, &protocol).await?;
        let timeout = self.config().exchange.response_timeout;

        let mut rtts = Vec::with_capacity(count);
        for _ in 0..count {
            rtts.push(app::ping(&mut stream, timeout).await?);
        }
        stream.close().await?;
        conn.close_and_wait().await;
        Ok(rtts)
    }

    /// Dial `addr` and ask the remote to identify itself.
    ///
    /// # Errors
    ///
    /// See [`Node::dial_protocol`] and [`identify::request`].
    pub async fn identify(&self, addr: &Multiaddr) -> Result<IdentifyInfo> {
        let protocol = ProtocolId::from_static(crate::IDENTIFY_PROTOCOL);
        let (conn, stream) = self.dial_protocol(addr, &protocol).await?;
        let info = identify::request(stream, conn.remote_peer(), &self.config().exchange).await;
        conn.close_and_wait().await;
        info
    }

    /// Start listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if no transport handles `addr` or binding
    /// fails.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<NodeListener> {
        let transport = self.upgrader.transport_for(addr)?;
        let listener = transport.listen(addr).await?;
        let node = NodeListener {
            listener,
            upgrader: Arc::clone(&self.upgrader),
        };
        tracing::info!("Listening on {}", node.p2p_addr());
        Ok(node)
    }
}

/// Accepting side of a [`Node`]
pub struct NodeListener {
    listener: Box<dyn Listener>,
    upgrader: Arc<Upgrader>,
}

impl NodeListener {
    /// Bound transport address
    #[must_use]
    pub fn local_addr(&self) -> Multiaddr {
        self.listener.local_addr()
    }

    /// Bound address with this node's `/p2p/<id>` appended, as dialers use it
    #[must_use]
    pub fn p2p_addr(&self) -> Multiaddr {
        self.local_addr()
            .with(Protocol::P2p(self.upgrader.identity().peer_id().to_bytes()))
    }

    /// Accept and upgrade the next connection.
    ///
    /// # Errors
    ///
    /// Returns the accept error, or the upgrade error of this connection.
    pub async fn accept(&mut self) -> Result<UpgradedConnection> {
        let (raw, remote_addr) = self.listener.accept().await?;
        tracing::debug!("Accepted raw connection from {}", remote_addr);
        self.upgrader.upgrade_inbound(raw, remote_addr).await
    }

    /// Serve connections forever: each connection is upgraded on its own
    /// task and every inbound stream is run by its registered handler.
    ///
    /// # Errors
    ///
    /// Returns only if accepting fails; upgrade and handler failures are
    /// logged and affect only their connection or stream.
    pub async fn serve(mut self) -> Result<()> {
        let identify = local_identify_info(&self.upgrader, vec![self.local_addr()]);
        loop {
            let (raw, remote_addr) = self.listener.accept().await?;
            let upgrader = Arc::clone(&self.upgrader);
            let local = identify.clone();

            tokio::spawn(async move {
                match upgrader.upgrade_inbound(raw, remote_addr.clone()).await {
                    Ok(conn) => serve_connection(conn, upgrader, local).await,
                    Err(e) => tracing::warn!("Inbound upgrade from {} failed: {}", remote_addr, e),
                }
            });
        }
    }
}

fn local_identify_info(upgrader: &Upgrader, listen_addrs: Vec<Multiaddr>) -> IdentifyInfo {
    let mut info = IdentifyInfo::new(upgrader.identity(), crate::DEFAULT_APP_PROTOCOL);
    info.listen_addrs = listen_addrs;
    info.protocols = upgrader
        .config()
        .protocols
        .ids()
        .map(|id| id.as_str().to_string())
        .collect();
    info
}

async fn serve_connection(conn: UpgradedConnection, upgrader: Arc<Upgrader>, mut local: IdentifyInfo) {
    let peer = conn.remote_peer();
    local.observed_addr = Some(conn.remote_addr().clone());
    let local = Arc::new(local);
    loop {
        let inbound = match conn.accept_stream().await {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!("Stopped accepting streams from {}: {}", peer, e);
                break;
            }
        };

        let upgrader = Arc::clone(&upgrader);
        let local = Arc::clone(&local);
        tokio::spawn(async move {
            let protocol = inbound.protocol.clone();
            if let Err(e) = app::handle_inbound(inbound, &upgrader.config().exchange, &local).await {
                tracing::debug!("{} handler for {} failed: {}", protocol, peer.short(), e);
            }
        });
    }
    conn.close();
}

impl std::fmt::Debug for NodeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeListener")
            .field("local_addr", &self.local_addr().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = NodeConfig::default();
        config.mux.max_streams = 0;
        assert!(matches!(
            Node::new(Identity::generate(), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_peer_id_stable() {
        let identity = Identity::from_seed(&[7u8; 32]);
        let expected = identity.peer_id();
        let node = Node::new(identity, NodeConfig::default()).unwrap();
        assert_eq!(node.peer_id(), expected);
        assert_eq!(node.clone().peer_id(), expected);
    }

    #[tokio::test]
    async fn test_listen_reports_p2p_addr() {
        let node = Node::new(Identity::generate(), NodeConfig::default()).unwrap();
        let listener = node
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.p2p_addr();
        assert_eq!(addr.peer_id(), Some(node.peer_id().to_bytes()));
        assert_ne!(listener.local_addr().to_string(), "/ip4/127.0.0.1/tcp/0");
    }

    #[tokio::test]
    async fn test_ping_over_tcp() {
        let server = Node::new(Identity::generate(), NodeConfig::default()).unwrap();
        let listener = server
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.p2p_addr();
        tokio::spawn(listener.serve());

        let client = Node::new(Identity::generate(), NodeConfig::default()).unwrap();
        let rtts = client.ping(&addr, 3).await.unwrap();
        assert_eq!(rtts.len(), 3);
    }

    #[tokio::test]
    async fn test_identify_over_websocket() {
        let server = Node::new(Identity::generate(), NodeConfig::default()).unwrap();
        let listener = server
            .listen(&"/ip4/127.0.0.1/tcp/0/ws".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.p2p_addr();
        let bound = listener.local_addr();
        tokio::spawn(listener.serve());

        let client = Node::new(Identity::generate(), NodeConfig::default()).unwrap();
        let info = client.identify(&addr).await.unwrap();

        assert_eq!(info.peer_id().unwrap(), server.peer_id());
        assert_eq!(info.listen_addrs, vec![bound]);
        assert_eq!(info.agent_version, crate::AGENT_VERSION);
        assert!(info.protocols.iter().any(|p| p == crate::PING_PROTOCOL));
        assert!(info.protocols.iter().any(|p| p == crate::IDENTIFY_PROTOCOL));
        assert!(info.observed_addr.is_some_and(|observed| observed.is_websocket()));
    }
}
