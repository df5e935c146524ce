//! Plain TCP transport.
//!
//! Handles `/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>` with an optional
//! trailing `/p2p/<id>`. Addresses ending in `/ws` belong to
//! [`WsTransport`](crate::websocket::WsTransport).

use crate::TransportConfig;
use crate::multiaddr::{HostTarget, Multiaddr};
use crate::transport::{BoxedConnection, Listener, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    /// Create a TCP transport.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connect a TCP socket to the host/port prefix of `addr`.
    ///
    /// Shared with the WebSocket transport. Not bounded by the dial timeout;
    /// callers apply it around the whole dial.
    pub(crate) async fn connect(&self, addr: &Multiaddr) -> TransportResult<TcpStream> {
        let candidates = resolve(addr).await?;

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(stream) => {
                    stream.set_nodelay(self.config.nodelay)?;
                    tracing::debug!("TCP connected to {}", candidate);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!("TCP connect to {} failed: {}", candidate, e);
                    last_err = Some(e);
                }
            }
        }

        Err(TransportError::ConnectionFailed(match last_err {
            Some(e) => format!("{addr}: {e}"),
            None => addr.to_string(),
        }))
    }

    /// Bind a TCP listener on the host/port prefix of `addr`.
    pub(crate) async fn bind(&self, addr: &Multiaddr) -> TransportResult<TcpListener> {
        let candidates = resolve(addr).await?;
        let first = candidates
            .first()
            .copied()
            .ok_or_else(|| TransportError::ResolveFailed(addr.to_string()))?;

        TcpListener::bind(first)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{first}: {e}")))
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }
}

/// Whether `addr` is `host/tcp/port[/p2p/id]` with nothing else after the port.
fn is_plain_tcp(addr: &Multiaddr) -> bool {
    let bare = addr.without_peer_id();
    bare.tcp_target().is_some() && bare.iter().count() == 2
}

/// Resolve the host/port prefix of `addr` to socket addresses.
pub(crate) async fn resolve(addr: &Multiaddr) -> TransportResult<Vec<SocketAddr>> {
    let (host, port) = addr
        .tcp_target()
        .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))?;

    match host {
        HostTarget::Ip(ip) => Ok(vec![SocketAddr::new(ip, port)]),
        HostTarget::Dns(name, family) => {
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), port))
                .await
                .map_err(|e| TransportError::ResolveFailed(format!("{name}: {e}")))?
                .filter(|a| family.accepts(a))
                .collect();
            if resolved.is_empty() {
                return Err(TransportError::ResolveFailed(name));
            }
            Ok(resolved)
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_handle(&self, addr: &Multiaddr) -> bool {
        is_plain_tcp(addr)
    }

    async fn dial(&self, addr: &Multiaddr) -> TransportResult<BoxedConnection> {
        if !self.can_handle(addr) {
            return Err(TransportError::UnsupportedAddress(addr.to_string()));
        }

        let stream = tokio::time::timeout(self.config.dial_timeout, self.connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> TransportResult<Box<dyn Listener>> {
        if !self.can_handle(addr) {
            return Err(TransportError::UnsupportedAddress(addr.to_string()));
        }

        let listener = self.bind(addr).await?;
        let local = Multiaddr::from_socket_addr(listener.local_addr()?, false);
        tracing::info!("TCP listening on {}", local);

        Ok(Box::new(TcpListenerHandle {
            listener,
            local,
            nodelay: self.config.nodelay,
        }))
    }
}

/// Accepting half of [`TcpTransport`]
pub struct TcpListenerHandle {
    listener: TcpListener,
    local: Multiaddr,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&mut self) -> TransportResult<(BoxedConnection, Multiaddr)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        tracing::debug!("TCP accepted connection from {}", remote);
        Ok((Box::new(stream), Multiaddr::from_socket_addr(remote, false)))
    }

    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_can_handle() {
        let tcp = TcpTransport::default();
        assert!(tcp.can_handle(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()));
        assert!(tcp.can_handle(&"/dns/localhost/tcp/1".parse().unwrap()));
        assert!(!tcp.can_handle(&"/ip4/127.0.0.1/tcp/1/ws".parse().unwrap()));
        assert!(!tcp.can_handle(&"/ip4/127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_tcp_dial_listen() {
        let tcp = TcpTransport::default();
        let mut listener = tcp
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.tcp_target().unwrap().1, 0);

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut conn = tcp.dial(&addr).await.unwrap();
        conn.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let tcp = TcpTransport::default();
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        assert!(matches!(
            tcp.dial(&addr).await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_unsupported() {
        let tcp = TcpTransport::default();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1/ws".parse().unwrap();
        assert!(matches!(
            tcp.dial(&addr).await,
            Err(TransportError::UnsupportedAddress(_))
        ));
    }
}
