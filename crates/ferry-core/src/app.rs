//! Application protocol handlers
//!
//! Inbound streams are routed by the protocol id agreed during per-stream
//! negotiation. The [`ProtocolRegistry`] maps each id to a [`Handler`]
//! variant, resolved once when the stream is accepted:
//!
//! - [`Handler::Echo`]: every length-prefixed frame is written back, and
//!   the stream is half-closed once the dialer half-closes
//! - [`Handler::Ping`]: 32-byte payloads are returned verbatim
//! - [`Handler::Identify`]: one [`IdentifyInfo`] record is written back
//! - [`Handler::Deliver`]: the stream is handed to the application through
//!   a bounded queue
//!
//! On the dialing side, [`Exchange`] sends one payload and returns the
//! replies as a pull-based sequence ([`Responses`]).

use crate::config::ExchangeConfig;
use crate::connection::InboundStream;
use crate::error::{Error, FrameError, Result};
use crate::framed::{Framed, write_frame};
use crate::identify::{self, IdentifyInfo};
use crate::mux::Stream;
use crate::negotiate::{ProtocolId, ProtocolTable};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Ping payload size
pub const PING_SIZE: usize = 32;

/// What to do with an inbound stream
#[derive(Debug, Clone)]
pub enum Handler {
    /// Echo every frame back
    Echo,
    /// Answer ping payloads
    Ping,
    /// Describe this node
    Identify,
    /// Hand the stream to the application
    Deliver(mpsc::Sender<InboundStream>),
}

impl Handler {
    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Handler::Echo => "echo",
            Handler::Ping => "ping",
            Handler::Identify => "identify",
            Handler::Deliver(_) => "deliver",
        }
    }
}

/// Protocols served on inbound streams
///
/// The default registry answers `/ipfs/ping/1.0.0` and `/ipfs/id/1.0.0`.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    table: ProtocolTable<Handler>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.insert(ProtocolId::from_static(crate::PING_PROTOCOL), Handler::Ping);
        registry.insert(
            ProtocolId::from_static(crate::IDENTIFY_PROTOCOL),
            Handler::Identify,
        );
        registry
    }
}

impl ProtocolRegistry {
    /// Registry that answers nothing
    #[must_use]
    pub fn empty() -> Self {
        Self {
            table: ProtocolTable::new(),
        }
    }

    /// Register `handler` for `protocol`, replacing any previous handler
    pub fn insert(&mut self, protocol: ProtocolId, handler: Handler) {
        tracing::debug!("Registered {} handler for {}", handler.name(), protocol);
        self.table.insert(protocol, handler);
    }

    /// Handler registered for `protocol` (exact match)
    #[must_use]
    pub fn get(&self, protocol: impl AsRef<str>) -> Option<&Handler> {
        self.table.get(protocol.as_ref())
    }

    /// Registered protocol ids, in registration order
    pub fn ids(&self) -> impl Iterator<Item = &ProtocolId> {
        self.table.ids()
    }

    /// Table consulted during negotiation
    #[must_use]
    pub fn table(&self) -> &ProtocolTable<Handler> {
        &self.table
    }
}

// ============================================================================
// Request / echo exchange
// ============================================================================

/// Client side of the request/echo exchange
#[derive(Debug)]
pub struct Exchange;

impl Exchange {
    /// Send `payload` as one frame, half-close, and return the replies.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] if `payload` exceeds the configured
    /// frame limit, or the stream error if the write fails.
    pub async fn start(
        mut stream: Stream,
        payload: &[u8],
        config: &ExchangeConfig,
    ) -> Result<Responses> {
        write_frame(&mut stream, payload, config.max_frame_len).await?;
        stream.close_write().await?;
        tracing::debug!(
            "Sent {} byte request on stream {}",
            payload.len(),
            stream.id()
        );

        Ok(Responses {
            framed: Framed::new(stream, config.max_frame_len),
            timeout: config.response_timeout,
            done: false,
        })
    }
}

/// Replies to an [`Exchange`]
///
/// A finite, non-restartable sequence: it ends when the remote half-closes,
/// and after the first error every further call returns `None`.
#[derive(Debug)]
pub struct Responses {
    framed: Framed<Stream>,
    timeout: Duration,
    done: bool,
}

impl Responses {
    /// Wait for the next reply payload.
    ///
    /// Returns `None` once the remote has closed its side of the stream.
    /// Each wait is bounded by the response timeout
    /// ([`Error::ResponseTimeout`]). Connection or stream failures, including
    /// end of stream inside a frame, are returned as errors.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>>> {
        if self.done {
            return None;
        }

        let err = match tokio::time::timeout(self.timeout, self.framed.read_frame()).await {
            Ok(Ok(payload)) => return Some(Ok(payload)),
            Ok(Err(Error::Frame(FrameError::ConnectionClosed))) => {
                tracing::debug!("Stream {} finished", self.framed.get_mut().id());
                self.done = true;
                return None;
            }
            Ok(Err(e)) => e,
            Err(_) => Error::ResponseTimeout(self.timeout),
        };

        self.done = true;
        Some(Err(err))
    }

    /// Read every reply until the remote closes.
    ///
    /// # Errors
    ///
    /// If the sequence fails after some payloads arrived, returns
    /// [`Error::PartialResponse`] carrying them; otherwise the failure
    /// itself.
    pub async fn collect_all(mut self) -> Result<Vec<Vec<u8>>> {
        let mut received = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(payload) => received.push(payload),
                Err(e) if received.is_empty() => return Err(e),
                Err(e) => {
                    return Err(Error::PartialResponse {
                        received,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(received)
    }

    /// The stream the replies arrive on
    pub fn stream_mut(&mut self) -> &mut Stream {
        self.framed.get_mut()
    }
}

/// Echo every frame on `stream` until the remote half-closes, then
/// half-close. Returns the number of frames echoed.
///
/// # Errors
///
/// Returns the first read or write failure.
pub async fn serve_echo(stream: Stream, config: &ExchangeConfig) -> Result<usize> {
    let mut framed = Framed::new(stream, config.max_frame_len);
    let mut echoed = 0;

    loop {
        match framed.read_frame().await {
            Ok(frame) => {
                framed.write_frame(&frame).await?;
                echoed += 1;
            }
            Err(Error::Frame(FrameError::ConnectionClosed)) => break,
            Err(e) => return Err(e),
        }
    }

    framed.get_mut().close_write().await?;
    tracing::debug!(
        "Echoed {} frames on stream {}",
        echoed,
        framed.get_mut().id()
    );
    Ok(echoed)
}

// ============================================================================
// Ping
// ============================================================================

/// Send one random ping payload and measure the round trip.
///
/// # Errors
///
/// - [`Error::ResponseTimeout`] if no reply arrives in time
/// - [`Error::PingMismatch`] if the reply differs from the request
pub async fn ping(stream: &mut Stream, timeout: Duration) -> Result<Duration> {
    let payload: [u8; PING_SIZE] = rand::random();
    let started = Instant::now();

    stream.write(&payload).await?;
    let mut reply = [0u8; PING_SIZE];
    tokio::time::timeout(timeout, stream.read_exact(&mut reply))
        .await
        .map_err(|_| Error::ResponseTimeout(timeout))?
        .map_err(Error::from)?;

    if reply != payload {
        return Err(Error::PingMismatch);
    }
    let rtt = started.elapsed();
    tracing::trace!("Ping on stream {} took {:?}", stream.id(), rtt);
    Ok(rtt)
}

/// Answer pings until the remote half-closes. Returns the pings answered.
///
/// # Errors
///
/// Returns the first read or write failure.
pub async fn serve_ping(mut stream: Stream) -> Result<usize> {
    let mut payload = [0u8; PING_SIZE];
    let mut answered = 0;

    loop {
        match stream.read_exact(&mut payload).await {
            Ok(_) => {
                stream.write_all(&payload).await?;
                answered += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }

    stream.close_write().await?;
    Ok(answered)
}

/// Run the handler resolved for an inbound stream to completion.
/// `identity` is what [`Handler::Identify`] reports for this connection.
///
/// # Errors
///
/// Returns the handler's failure. A [`Handler::Deliver`] whose receiver is
/// gone resets the stream and reports `ConnectionClosed`.
pub async fn handle_inbound(
    inbound: InboundStream,
    config: &ExchangeConfig,
    identity: &IdentifyInfo,
) -> Result<()> {
    let protocol = inbound.protocol.clone();
    match inbound.handler.clone() {
        Handler::Echo => {
            serve_echo(inbound.stream, config).await?;
        }
        Handler::Ping => {
            serve_ping(inbound.stream).await?;
        }
        Handler::Identify => {
            identify::serve(inbound.stream, identity, config).await?;
        }
        Handler::Deliver(tx) => {
            if let Err(mpsc::error::SendError(mut rejected)) = tx.send(inbound).await {
                tracing::warn!("No receiver for {} streams, resetting", protocol);
                rejected.stream.reset().await?;
                return Err(crate::error::MultiplexError::ConnectionClosed.into());
            }
        }
    }
    Ok(())
}
