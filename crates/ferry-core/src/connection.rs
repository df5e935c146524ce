//! Upgraded connections
//!
//! An [`UpgradedConnection`] is a raw connection after the upgrade
//! pipeline: every byte passes through the secure session, and the
//! multiplexer on top of it carries any number of streams. Each stream is
//! negotiated to an application protocol before it is handed out.
//!
//! Inbound streams are negotiated concurrently, one task per stream, and
//! queued once ready. A stream that stalls or fails its negotiation is
//! reset on its own; siblings and the connection are unaffected.

use crate::app::Handler;
use crate::config::NodeConfig;
use crate::error::{Error, MultiplexError, Result};
use crate::identity::PeerId;
use crate::mux::{Multiplexer, Stream};
use crate::negotiate::{self, ProtocolId};
use ferry_transport::Multiaddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};

/// Which side established the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// We dialed
    Dialer,
    /// We accepted
    Listener,
}

/// A remotely opened stream, negotiated and ready for its handler
#[derive(Debug)]
pub struct InboundStream {
    /// The stream
    pub stream: Stream,
    /// Agreed application protocol
    pub protocol: ProtocolId,
    /// Handler registered for that protocol
    pub handler: Handler,
}

/// Negotiated inbound streams waiting for `accept_stream`
struct InboundQueue {
    ready: mpsc::Receiver<InboundStream>,
    task: JoinHandle<()>,
}

/// Secured, multiplexed connection to one authenticated peer
pub struct UpgradedConnection {
    mux: Arc<Multiplexer>,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    endpoint: Endpoint,
    config: Arc<NodeConfig>,
    closed: AtomicBool,
    inbound: Mutex<Option<InboundQueue>>,
}

impl UpgradedConnection {
    pub(crate) fn new(
        mux: Multiplexer,
        remote_peer: PeerId,
        remote_addr: Multiaddr,
        endpoint: Endpoint,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self {
            mux: Arc::new(mux),
            remote_peer,
            remote_addr,
            endpoint,
            config,
            closed: AtomicBool::new(false),
            inbound: Mutex::new(None),
        }
    }

    /// Peer authenticated during the handshake
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Transport address of the remote
    #[must_use]
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    /// Which side established the connection
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Number of live streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.mux.stream_count()
    }

    /// Open a stream and negotiate `protocol` on it.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::NegotiationError::NoCommonProtocol`] if the
    /// remote does not serve `protocol`; the stream is reset in that case.
    /// Otherwise see [`Multiplexer::open_stream`].
    pub async fn open_stream(&self, protocol: &ProtocolId) -> Result<Stream> {
        self.open_stream_with(std::slice::from_ref(protocol)).await
    }

    /// Open a stream and negotiate the first of `protocols` the remote
    /// accepts.
    ///
    /// # Errors
    ///
    /// See [`UpgradedConnection::open_stream`].
    pub async fn open_stream_with(&self, protocols: &[ProtocolId]) -> Result<Stream> {
        let mut stream = self.mux.open_stream().await?;

        match negotiate::dialer_select(&mut stream, protocols, &self.config.negotiation).await {
            Ok(protocol) => {
                tracing::debug!(
                    "Stream {} to {} negotiated {}",
                    stream.id(),
                    self.remote_peer.short(),
                    protocol
                );
                stream.set_protocol(protocol);
                Ok(stream)
            }
            Err(e) => {
                tracing::debug!("Stream {} negotiation failed: {}", stream.id(), e);
                let _ = stream.reset().await;
                Err(e)
            }
        }
    }

    /// Wait for the next remotely opened stream whose protocol is
    /// registered.
    ///
    /// The first call starts negotiating inbound streams in the background.
    /// Streams that fail negotiation are reset and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MultiplexError::ConnectionClosed`] once the
    /// connection is gone.
    pub async fn accept_stream(&self) -> Result<InboundStream> {
        let mut inbound = self.inbound.lock().await;
        let queue = inbound.get_or_insert_with(|| self.start_inbound());
        queue
            .ready
            .recv()
            .await
            .ok_or(Error::Multiplex(MultiplexError::ConnectionClosed))
    }

    fn start_inbound(&self) -> InboundQueue {
        let (tx, ready) = mpsc::channel(self.config.mux.incoming_queue.max(1));
        let task = tokio::spawn(accept_inbound(
            Arc::clone(&self.mux),
            Arc::clone(&self.config),
            self.remote_peer,
            tx,
        ));
        InboundQueue { ready, task }
    }

    /// Close the connection and every stream on it. Pending reads wake with
    /// `ConnectionClosed`. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mux.close();
        tracing::info!("Connection to {} closed", self.remote_peer);
    }

    /// Close and wait until queued frames are flushed.
    pub async fn close_and_wait(&self) {
        self.close();
        self.mux.close_and_wait().await;
    }

    /// True once the connection is closed, locally or by the remote
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.mux.is_closed()
    }
}

impl Drop for UpgradedConnection {
    fn drop(&mut self) {
        self.close();
        if let Some(queue) = self.inbound.get_mut() {
            queue.task.abort();
        }
    }
}

/// Accept remotely opened streams and negotiate each on its own task.
/// In-flight negotiations are aborted when the connection goes away.
async fn accept_inbound(
    mux: Arc<Multiplexer>,
    config: Arc<NodeConfig>,
    remote_peer: PeerId,
    ready: mpsc::Sender<InboundStream>,
) {
    let mut negotiations = JoinSet::new();
    loop {
        tokio::select! {
            accepted = mux.accept_stream() => match accepted {
                Ok(stream) => {
                    negotiations.spawn(negotiate_inbound(
                        stream,
                        Arc::clone(&config),
                        remote_peer,
                        ready.clone(),
                    ));
                }
                Err(e) => {
                    tracing::debug!("Inbound streams from {} ended: {}", remote_peer.short(), e);
                    break;
                }
            },
            Some(_) = negotiations.join_next(), if !negotiations.is_empty() => {}
        }
    }
}

async fn negotiate_inbound(
    mut stream: Stream,
    config: Arc<NodeConfig>,
    remote_peer: PeerId,
    ready: mpsc::Sender<InboundStream>,
) {
    match negotiate::listener_select(&mut stream, config.protocols.table(), &config.negotiation)
        .await
    {
        Ok(negotiated) => {
            tracing::debug!(
                "Inbound stream {} from {} negotiated {}",
                stream.id(),
                remote_peer.short(),
                negotiated.protocol
            );
            stream.set_protocol(negotiated.protocol.clone());
            let inbound = InboundStream {
                stream,
                protocol: negotiated.protocol,
                handler: negotiated.handler,
            };
            // Dropping an unaccepted stream resets it
            if ready.send(inbound).await.is_err() {
                tracing::debug!("Connection to {} dropped before accept", remote_peer.short());
            }
        }
        Err(e) => {
            tracing::debug!("Inbound stream {} rejected: {}", stream.id(), e);
            let _ = stream.reset().await;
        }
    }
}

impl std::fmt::Debug for UpgradedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedConnection")
            .field("remote_peer", &self.remote_peer)
            .field("remote_addr", &self.remote_addr.to_string())
            .field("endpoint", &self.endpoint)
            .field("mux", &self.mux)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ProtocolRegistry;
    use crate::error::{Error, MultiplexError, NegotiationError};
    use crate::identity::Identity;
    use std::time::Duration;

    fn connection_pair(registry: ProtocolRegistry) -> (UpgradedConnection, UpgradedConnection) {
        let config = Arc::new(NodeConfig {
            protocols: registry,
            ..NodeConfig::default()
        });
        let (a, b) = tokio::io::duplex(64 * 1024);
        let peer_a = Identity::generate().peer_id();
        let peer_b = Identity::generate().peer_id();
        let addr = Multiaddr::empty();
        (
            UpgradedConnection::new(
                Multiplexer::new(a, config.mux.clone()),
                peer_b,
                addr.clone(),
                Endpoint::Dialer,
                Arc::clone(&config),
            ),
            UpgradedConnection::new(
                Multiplexer::new(b, config.mux.clone()),
                peer_a,
                addr,
                Endpoint::Listener,
                config,
            ),
        )
    }

    #[tokio::test]
    async fn test_stream_negotiation() {
        let protocol = ProtocolId::from_static("/app/1.0.0");
        let mut registry = ProtocolRegistry::empty();
        registry.insert(protocol.clone(), Handler::Echo);
        let (dialer, listener) = connection_pair(registry);

        let accept = tokio::spawn(async move {
            let inbound = listener.accept_stream().await.unwrap();
            (inbound.protocol, inbound.handler, listener)
        });

        let stream = dialer.open_stream(&protocol).await.unwrap();
        assert_eq!(stream.protocol(), Some(&protocol));

        let (agreed, handler, _listener) = accept.await.unwrap();
        assert_eq!(agreed, protocol);
        assert!(matches!(handler, Handler::Echo));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_skipped() {
        let protocol = ProtocolId::from_static("/app/1.0.0");
        let mut registry = ProtocolRegistry::empty();
        registry.insert(protocol.clone(), Handler::Echo);
        let (dialer, listener) = connection_pair(registry);

        let accept = tokio::spawn(async move {
            let inbound = listener.accept_stream().await.unwrap();
            (inbound.protocol, listener)
        });

        let unknown = ProtocolId::from_static("/other/1.0.0");
        assert!(matches!(
            dialer.open_stream(&unknown).await,
            Err(Error::Negotiation(NegotiationError::NoCommonProtocol))
        ));

        // The listener keeps accepting after the failed stream
        dialer.open_stream(&protocol).await.unwrap();
        let (agreed, _listener) = accept.await.unwrap();
        assert_eq!(agreed, protocol);
    }

    #[tokio::test]
    async fn test_stream_closed_before_header_is_skipped() {
        let protocol = ProtocolId::from_static("/app/1.0.0");
        let mut registry = ProtocolRegistry::empty();
        registry.insert(protocol.clone(), Handler::Echo);
        let (dialer, listener) = connection_pair(registry);

        let accept = tokio::spawn(async move {
            let inbound = listener.accept_stream().await.unwrap();
            (inbound.protocol, listener)
        });

        // Half-closed without a single negotiation byte
        let mut raw = dialer.mux.open_stream().await.unwrap();
        raw.close_write().await.unwrap();

        dialer.open_stream(&protocol).await.unwrap();
        let (agreed, listener) = accept.await.unwrap();
        assert_eq!(agreed, protocol);
        assert!(!listener.is_closed());
        assert!(!dialer.is_closed());
    }

    #[tokio::test]
    async fn test_stalled_negotiation_does_not_block_siblings() {
        let protocol = ProtocolId::from_static("/app/1.0.0");
        let mut registry = ProtocolRegistry::empty();
        registry.insert(protocol.clone(), Handler::Echo);
        let (dialer, listener) = connection_pair(registry);
        assert!(NodeConfig::default().negotiation.timeout >= Duration::from_secs(5));

        let accept = tokio::spawn(async move {
            let inbound = listener.accept_stream().await.unwrap();
            (inbound.protocol, listener)
        });

        // Opened and left silent
        let _stalled = dialer.mux.open_stream().await.unwrap();

        let sibling = tokio::time::timeout(Duration::from_secs(2), dialer.open_stream(&protocol))
            .await
            .expect("sibling negotiation waited on the stalled stream");
        assert_eq!(sibling.unwrap().protocol(), Some(&protocol));

        let (agreed, _listener) = tokio::time::timeout(Duration::from_secs(2), accept)
            .await
            .expect("accept waited on the stalled stream")
            .unwrap();
        assert_eq!(agreed, protocol);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (dialer, listener) = connection_pair(ProtocolRegistry::default());
        dialer.close();
        dialer.close();
        assert!(dialer.is_closed());
        assert!(matches!(
            dialer.open_stream(&ProtocolId::from_static(crate::PING_PROTOCOL)).await,
            Err(Error::Multiplex(MultiplexError::ConnectionClosed))
        ));
        assert!(matches!(
            listener.accept_stream().await,
            Err(Error::Multiplex(MultiplexError::ConnectionClosed))
        ));
        assert!(listener.is_closed());
    }
}
