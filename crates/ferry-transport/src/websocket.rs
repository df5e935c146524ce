//! WebSocket transport (RFC 6455) over TCP.
//!
//! Handles `<host>/tcp/<port>/ws` addresses. The HTTP upgrade and the frame
//! codec come from `tokio-tungstenite`; [`WsStream`] turns the resulting
//! message stream back into a byte stream. Every write becomes one binary
//! message.
//!
//! Only binary data is carried. Pings are answered, a close frame ends the
//! read side, and text frames are a protocol error.

use crate::TransportConfig;
use crate::multiaddr::{HostTarget, Multiaddr, Protocol};
use crate::tcp::TcpTransport;
use crate::transport::{BoxedConnection, Listener, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};

/// Largest payload put in one outgoing message
const MAX_OUTGOING_MESSAGE: usize = 64 * 1024;

fn ws_config(max_message: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message);
    config.max_frame_size = Some(max_message);
    config
}

fn io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::ErrorKind::BrokenPipe.into()
        }
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Byte-stream view of an upgraded WebSocket connection
pub struct WsStream<T> {
    inner: WebSocketStream<T>,
    pending: Vec<u8>,
    offset: usize,
    read_closed: bool,
}

impl<T> WsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn new(inner: WebSocketStream<T>) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            offset: 0,
            read_closed: false,
        }
    }
}

impl<T> AsyncRead for WsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.pending = data;
                    this.offset = 0;
                }
                // Pongs are queued by tungstenite and sent on the next poll
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!("WebSocket closed by peer: {:?}", frame);
                    this.read_closed = true;
                }
                None => this.read_closed = true,
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected WebSocket text frame",
                    )));
                }
                Some(Err(e)) => return Poll::Ready(Err(io_error(e))),
            }
        }
    }
}

impl<T> AsyncWrite for WsStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io_error)?;

        let n = buf.len().min(MAX_OUTGOING_MESSAGE);
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf[..n].to_vec()))
            .map_err(io_error)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(io_error(e))),
        }
    }
}

/// Perform the client side of the upgrade over an established stream.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] if the server refuses the upgrade
/// or answers with a malformed response.
pub async fn client_upgrade<T>(stream: T, host: &str, max_message: usize) -> TransportResult<WsStream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let url = format!("ws://{host}/");
    let (ws, response) =
        tokio_tungstenite::client_async_with_config(url.as_str(), stream, Some(ws_config(max_message)))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
    tracing::trace!("WebSocket upgrade answered with {}", response.status());
    Ok(WsStream::new(ws))
}

/// Answer a client's upgrade request over an accepted stream.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] for anything but a valid
/// WebSocket upgrade request.
pub async fn server_upgrade<T>(stream: T, max_message: usize) -> TransportResult<WsStream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config(max_message)))
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(WsStream::new(ws))
}

/// WebSocket transport
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    tcp: TcpTransport,
}

impl WsTransport {
    /// Create a WebSocket transport.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            tcp: TcpTransport::new(config),
        }
    }
}

/// Strip `/ws` (and `/p2p`) to get the underlying TCP address.
fn tcp_part(addr: &Multiaddr) -> Multiaddr {
    addr.without_peer_id()
        .iter()
        .filter(|p| !matches!(p, Protocol::Ws))
        .cloned()
        .fold(Multiaddr::empty(), Multiaddr::with)
}

#[async_trait]
impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn can_handle(&self, addr: &Multiaddr) -> bool {
        let bare = addr.without_peer_id();
        bare.is_websocket() && bare.tcp_target().is_some() && bare.iter().count() == 3
    }

    async fn dial(&self, addr: &Multiaddr) -> TransportResult<BoxedConnection> {
        if !self.can_handle(addr) {
            return Err(TransportError::UnsupportedAddress(addr.to_string()));
        }
        let target = tcp_part(addr);
        let host = match target.tcp_target() {
            Some((HostTarget::Ip(ip), port)) => std::net::SocketAddr::new(ip, port).to_string(),
            Some((HostTarget::Dns(name, _), port)) => format!("{name}:{port}"),
            None => return Err(TransportError::UnsupportedAddress(addr.to_string())),
        };
        let config = self.tcp.config();

        let stream = tokio::time::timeout(config.dial_timeout, async {
            let tcp = self.tcp.connect(&target).await?;
            client_upgrade(tcp, &host, config.max_ws_frame).await
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> TransportResult<Box<dyn Listener>> {
        if !self.can_handle(addr) {
            return Err(TransportError::UnsupportedAddress(addr.to_string()));
        }
        let listener = self.tcp.bind(&tcp_part(addr)).await?;
        let local = Multiaddr::from_socket_addr(listener.local_addr()?, true);
        tracing::info!("WebSocket listening on {}", local);

        Ok(Box::new(WsListener {
            listener,
            local,
            config: self.tcp.config().clone(),
        }))
    }
}

/// Accepting half of [`WsTransport`]
pub struct WsListener {
    listener: TcpListener,
    local: Multiaddr,
    config: TransportConfig,
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> TransportResult<(BoxedConnection, Multiaddr)> {
        loop {
            let (stream, remote) = self.listener.accept().await?;
            stream.set_nodelay(self.config.nodelay)?;

            let upgrade = tokio::time::timeout(
                self.config.dial_timeout,
                server_upgrade(stream, self.config.max_ws_frame),
            )
            .await;

            match upgrade {
                Ok(Ok(ws)) => {
                    tracing::debug!("WebSocket accepted connection from {}", remote);
                    return Ok((Box::new(ws), Multiaddr::from_socket_addr(remote, true)));
                }
                Ok(Err(e)) => tracing::warn!("WebSocket upgrade from {} failed: {}", remote, e),
                Err(_) => tracing::warn!("WebSocket upgrade from {} timed out", remote),
            }
        }
    }

    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }
}
