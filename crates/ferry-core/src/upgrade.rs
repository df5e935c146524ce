//! Connection upgrade pipeline
//!
//! ```text
//! raw ─▶ negotiate /ferry-sigdh/1.0.0 ─▶ handshake ─▶ negotiate /mplex/6.7.0 ─▶ multiplexer
//! ```
//!
//! Any failure aborts the whole upgrade and drops the raw connection. One
//! raw connection yields at most one [`UpgradedConnection`].

use crate::config::NodeConfig;
use crate::connection::{Endpoint, UpgradedConnection};
use crate::error::Result;
use crate::identity::{Identity, PeerId};
use crate::mux::Multiplexer;
use crate::negotiate::{self, ProtocolId, ProtocolTable};
use crate::secure;
use crate::{MPLEX_PROTOCOL, SECURE_PROTOCOL};
use ferry_transport::{Multiaddr, RawConnection, Transport, TransportError, default_transports};
use std::sync::Arc;
use std::time::Instant;

const SECURE: ProtocolId = ProtocolId::from_static(SECURE_PROTOCOL);
const MPLEX: ProtocolId = ProtocolId::from_static(MPLEX_PROTOCOL);

/// Turns raw connections into [`UpgradedConnection`]s
pub struct Upgrader {
    identity: Arc<Identity>,
    config: Arc<NodeConfig>,
    transports: Vec<Arc<dyn Transport>>,
}

impl Upgrader {
    /// Upgrader with the standard transports (WebSocket, then TCP)
    #[must_use]
    pub fn new(identity: Arc<Identity>, config: Arc<NodeConfig>) -> Self {
        let transports = default_transports(&config.transport);
        Self::with_transports(identity, config, transports)
    }

    /// Upgrader with an explicit transport list, tried in order
    #[must_use]
    pub fn with_transports(
        identity: Arc<Identity>,
        config: Arc<NodeConfig>,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        Self {
            identity,
            config,
            transports,
        }
    }

    /// Shared configuration
    #[must_use]
    pub fn config(&self) -> &Arc<NodeConfig> {
        &self.config
    }

    /// Local identity
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// First transport that handles `addr`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedAddress`] if none does.
    pub fn transport_for(&self, addr: &Multiaddr) -> Result<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.can_handle(addr))
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()).into())
    }

    /// Dial `addr` and upgrade the connection.
    ///
    /// The remote must prove `expected` if given, otherwise the address's
    /// trailing `/p2p/<id>` if it has one.
    ///
    /// # Errors
    ///
    /// Any transport, negotiation or security error; the raw connection is
    /// closed in every case.
    pub async fn upgrade_outbound(
        &self,
        addr: &Multiaddr,
        expected: Option<PeerId>,
    ) -> Result<UpgradedConnection> {
        let expected = expected.or_else(|| addr.peer_id().map(PeerId::from_bytes));
        let transport = self.transport_for(addr)?;

        tracing::debug!("Dialing {} over {}", addr, transport.name());
        let raw = transport.dial(addr).await?;

        self.upgrade_raw_outbound(raw, addr.without_peer_id(), expected)
            .await
            .inspect_err(|e| tracing::warn!("Outbound upgrade to {} failed: {}", addr, e))
    }

    /// Upgrade an already established outbound raw connection.
    ///
    /// # Errors
    ///
    /// See [`Upgrader::upgrade_outbound`].
    pub async fn upgrade_raw_outbound<T>(
        &self,
        mut raw: T,
        remote_addr: Multiaddr,
        expected: Option<PeerId>,
    ) -> Result<UpgradedConnection>
    where
        T: RawConnection,
    {
        let started = Instant::now();
        let negotiation = &self.config.negotiation;

        negotiate::dialer_select(&mut raw, &[SECURE], negotiation).await?;
        let mut session =
            secure::secure_outbound(raw, &self.identity, expected, &self.config.security).await?;
        negotiate::dialer_select(&mut session, &[MPLEX], negotiation).await?;

        let remote_peer = session.remote_peer();
        let mux = Multiplexer::new(session, self.config.mux.clone());
        tracing::info!(
            "Connection established with {} at {} in {:?}",
            remote_peer,
            remote_addr,
            started.elapsed()
        );

        Ok(UpgradedConnection::new(
            mux,
            remote_peer,
            remote_addr,
            Endpoint::Dialer,
            Arc::clone(&self.config),
        ))
    }

    /// Upgrade an accepted raw connection.
    ///
    /// # Errors
    ///
    /// Any negotiation or security error; the raw connection is closed.
    pub async fn upgrade_inbound<T>(
        &self,
        mut raw: T,
        remote_addr: Multiaddr,
    ) -> Result<UpgradedConnection>
    where
        T: RawConnection,
    {
        let negotiation = &self.config.negotiation;

        let mut table = ProtocolTable::new();
        table.insert(SECURE, ());
        negotiate::listener_select(&mut raw, &table, negotiation).await?;
        let mut session = secure::secure_inbound(raw, &self.identity, &self.config.security).await?;

        let mut table = ProtocolTable::new();
        table.insert(MPLEX, ());
        negotiate::listener_select(&mut session, &table, negotiation).await?;

        let remote_peer = session.remote_peer();
        let mux = Multiplexer::new(session, self.config.mux.clone());
        tracing::info!("Connection established with {} from {}", remote_peer, remote_addr);

        Ok(UpgradedConnection::new(
            mux,
            remote_peer,
            remote_addr,
            Endpoint::Listener,
            Arc::clone(&self.config),
        ))
    }
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("peer_id", &self.identity.peer_id())
            .field(
                "transports",
                &self.transports.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
