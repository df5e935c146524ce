//! Multiplexed streams.

use super::{Flag, Frame, MuxShared, StreamKey};
use crate::error::{Error, MultiplexError, Result};
use crate::negotiate::ProtocolId;
use std::future::{Future, poll_fn};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, OwnedPermit, error::SendError};

/// Stream lifecycle
///
/// ```text
/// Init ──▶ Open ──┬──▶ HalfClosedLocal ──┬──▶ Closed
///                 └──▶ HalfClosedRemote ─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Allocated locally, open frame not sent yet
    Init,
    /// Both directions open
    Open,
    /// Local write side closed, still reading
    HalfClosedLocal,
    /// Remote write side closed, still writing
    HalfClosedRemote,
    /// Both directions closed, or reset (terminal)
    Closed,
}

impl StreamState {
    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(self, to: StreamState) -> bool {
        match (self, to) {
            (StreamState::Init, StreamState::Open | StreamState::Closed) => true,
            (
                StreamState::Open,
                StreamState::HalfClosedLocal | StreamState::HalfClosedRemote | StreamState::Closed,
            ) => true,
            (StreamState::HalfClosedLocal | StreamState::HalfClosedRemote, StreamState::Closed) => {
                true
            }
            _ => false,
        }
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::StreamClosed`] if the transition is not
    /// allowed from the current state.
    pub fn transition_to(&mut self, to: StreamState) -> std::result::Result<(), MultiplexError> {
        if !self.can_transition(to) {
            return Err(MultiplexError::StreamClosed);
        }
        tracing::trace!("Stream state transition: {:?} -> {:?}", self, to);
        *self = to;
        Ok(())
    }

    /// True if the local side may still write
    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }
}

/// Per-stream state shared with the multiplexer's reader task
pub(crate) struct StreamShared {
    state: Mutex<StreamState>,
    reset: AtomicBool,
    remote_eof: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new(state: StreamState) -> Self {
        Self {
            state: Mutex::new(state),
            reset: AtomicBool::new(false),
            remote_eof: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> StreamState {
        *self.lock()
    }

    fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    fn set(&self, to: StreamState) {
        let mut state = self.lock();
        if *state != to {
            let _ = state.transition_to(to);
        }
    }

    fn on_local_close(&self) {
        let mut state = self.lock();
        let next = match *state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        if next != *state {
            let _ = state.transition_to(next);
        }
    }

    pub(crate) fn on_remote_close(&self) {
        self.remote_eof.store(true, Ordering::Release);
        let mut state = self.lock();
        let next = match *state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        if next != *state {
            let _ = state.transition_to(next);
        }
    }

    pub(crate) fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.set(StreamState::Closed);
    }

    pub(crate) fn on_connection_closed(&self) {
        self.set(StreamState::Closed);
    }
}

type ReserveFuture =
    Pin<Box<dyn Future<Output = std::result::Result<OwnedPermit<Frame>, SendError<()>>> + Send>>;

/// One logical bidirectional byte stream
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]; `poll_shutdown` closes the
/// write side only. Dropping a stream that is not fully closed resets it.
pub struct Stream {
    mux: Weak<MuxShared>,
    key: StreamKey,
    shared: Arc<StreamShared>,
    /// `None` once the local side closed the stream
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    leftover: Vec<u8>,
    leftover_pos: usize,
    eof_delivered: bool,
    max_frame_len: usize,
    reserving: Option<ReserveFuture>,
    protocol: Option<ProtocolId>,
}

impl Stream {
    pub(crate) fn new(
        mux: Weak<MuxShared>,
        key: StreamKey,
        shared: Arc<StreamShared>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let max_frame_len = mux.upgrade().map_or(1, |m| m.config().max_frame_len);
        Self {
            mux,
            key,
            shared,
            rx: Some(rx),
            leftover: Vec::new(),
            leftover_pos: 0,
            eof_delivered: false,
            max_frame_len,
            reserving: None,
            protocol: None,
        }
    }

    pub(crate) fn mark_open(&self) {
        self.shared.set(StreamState::Open);
    }

    /// Stream number (scoped to the side that opened it)
    #[must_use]
    pub fn id(&self) -> u64 {
        self.key.id
    }

    /// True if this side opened the stream
    #[must_use]
    pub fn is_outbound(&self) -> bool {
        self.key.local_initiator
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Protocol negotiated on this stream, once known
    #[must_use]
    pub fn protocol(&self) -> Option<&ProtocolId> {
        self.protocol.as_ref()
    }

    /// Tag the stream with its negotiated protocol
    pub fn set_protocol(&mut self, protocol: ProtocolId) {
        self.protocol = Some(protocol);
    }

    fn mux(&self) -> std::result::Result<Arc<MuxShared>, MultiplexError> {
        match self.mux.upgrade() {
            Some(mux) if !mux.is_closed() => Ok(mux),
            _ => Err(MultiplexError::ConnectionClosed),
        }
    }

    fn check_writable(&self) -> std::result::Result<Arc<MuxShared>, MultiplexError> {
        if self.shared.is_reset() {
            return Err(MultiplexError::StreamReset);
        }
        let mux = self.mux()?;
        if !self.state().can_write() {
            return Err(MultiplexError::StreamClosed);
        }
        Ok(mux)
    }

    /// Wait for room in the writer queue.
    fn poll_reserve(
        &mut self,
        cx: &mut Context<'_>,
        mux: &MuxShared,
    ) -> Poll<std::result::Result<OwnedPermit<Frame>, MultiplexError>> {
        let reserving = self.reserving.get_or_insert_with(|| -> ReserveFuture {
            Box::pin(mux.outbound().clone().reserve_owned())
        });
        let result = ready!(reserving.as_mut().poll(cx));
        self.reserving = None;
        Poll::Ready(result.map_err(|_| MultiplexError::ConnectionClosed))
    }

    fn poll_write_frame(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, MultiplexError>> {
        let mux = self.check_writable()?;
        let permit = ready!(self.poll_reserve(cx, &mux))?;

        // State may have changed while waiting for room
        let mux = self.check_writable()?;
        let n = buf.len().min(self.max_frame_len);
        permit.send(Frame::new(
            self.key.id,
            Flag::message(self.key.local_initiator),
            buf[..n].to_vec(),
        ));
        drop(mux);
        Poll::Ready(Ok(n))
    }

    fn poll_close_write(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), MultiplexError>> {
        if self.shared.is_reset() || !self.state().can_write() {
            return Poll::Ready(Ok(()));
        }
        let Ok(mux) = self.mux() else {
            return Poll::Ready(Ok(()));
        };

        let permit = ready!(self.poll_reserve(cx, &mux))?;
        if self.shared.is_reset() || !self.state().can_write() {
            return Poll::Ready(Ok(()));
        }
        permit.send(Frame::control(
            self.key.id,
            Flag::close(self.key.local_initiator),
        ));
        self.shared.on_local_close();
        mux.local_closed(self.key);
        tracing::trace!("Stream {} write side closed", self.key.id);
        Poll::Ready(Ok(()))
    }

    fn poll_next_chunk(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<Option<Vec<u8>>, MultiplexError>> {
        if self.leftover_pos < self.leftover.len() {
            let chunk = self.leftover.split_off(self.leftover_pos);
            self.leftover.clear();
            self.leftover_pos = 0;
            return Poll::Ready(Ok(Some(chunk)));
        }

        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(MultiplexError::StreamClosed));
        };
        if self.eof_delivered && self.shared.state() == StreamState::Closed {
            return Poll::Ready(Err(MultiplexError::StreamClosed));
        }

        match ready!(rx.poll_recv(cx)) {
            Some(chunk) => Poll::Ready(Ok(Some(chunk))),
            None if self.shared.is_reset() => Poll::Ready(Err(MultiplexError::StreamReset)),
            None if self.shared.remote_eof.load(Ordering::Acquire) => {
                self.eof_delivered = true;
                Poll::Ready(Ok(None))
            }
            None => Poll::Ready(Err(MultiplexError::ConnectionClosed)),
        }
    }

    /// Read the next chunk of data as sent by the remote.
    ///
    /// Returns `None` once the remote has closed its write side.
    ///
    /// # Errors
    ///
    /// - [`MultiplexError::StreamClosed`] after [`Stream::close`]
    /// - [`MultiplexError::StreamReset`] if either side reset the stream
    /// - [`MultiplexError::ConnectionClosed`] if the connection went away
    ///
    /// Data received before any of these is still returned first.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        poll_fn(|cx| self.poll_next_chunk(cx))
            .await
            .map_err(Error::from)
    }

    /// Write all of `data`, split into frames of at most the configured size.
    ///
    /// # Errors
    ///
    /// - [`MultiplexError::StreamClosed`] after the write side was closed
    /// - [`MultiplexError::StreamReset`] if either side reset the stream
    /// - [`MultiplexError::ConnectionClosed`] if the connection went away
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            written += poll_fn(|cx| self.poll_write_frame(cx, &data[written..])).await?;
        }
        Ok(())
    }

    /// Close the write side. The remote reads end of stream; this side can
    /// keep reading. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::ConnectionClosed`] if the close frame could
    /// not be queued.
    pub async fn close_write(&mut self) -> Result<()> {
        poll_fn(|cx| self.poll_close_write(cx)).await?;
        Ok(())
    }

    /// Close both directions. Data still arriving is discarded. The stream
    /// id is recycled once the remote has closed too. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::ConnectionClosed`] if the close frame could
    /// not be queued.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.close_write().await;
        self.rx = None;
        self.shared.set(StreamState::Closed);
        match result {
            Err(Error::Multiplex(MultiplexError::ConnectionClosed)) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Abort the stream in both directions.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::ConnectionClosed`] if the reset frame could
    /// not be queued.
    pub async fn reset(&mut self) -> Result<()> {
        if self.shared.is_reset() || self.state() == StreamState::Closed {
            return Ok(());
        }
        let mux = self.mux()?;
        mux.outbound()
            .send(Frame::control(
                self.key.id,
                Flag::reset(self.key.local_initiator),
            ))
            .await
            .map_err(|_| MultiplexError::ConnectionClosed)?;
        self.shared.mark_reset();
        mux.local_reset(self.key);
        self.rx = None;
        tracing::debug!("Stream {} reset", self.key.id);
        Ok(())
    }
}

fn to_io(err: MultiplexError) -> io::Error {
    Error::Multiplex(err).into()
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.leftover_pos == this.leftover.len() {
            match ready!(this.poll_next_chunk(cx)) {
                Ok(Some(chunk)) => {
                    this.leftover = chunk;
                    this.leftover_pos = 0;
                }
                Ok(None) => return Poll::Ready(Ok(())),
                Err(e) => return Poll::Ready(Err(to_io(e))),
            }
        }

        let available = &this.leftover[this.leftover_pos..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.leftover_pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.get_mut().poll_write_frame(cx, buf).map_err(to_io)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task, which flushes every batch
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close_write(cx).map_err(to_io)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.state() == StreamState::Closed || self.shared.is_reset() {
            return;
        }
        let Ok(mux) = self.mux() else {
            return;
        };
        tracing::trace!("Stream {} dropped before close, resetting", self.key.id);
        mux.send_control(Frame::control(
            self.key.id,
            Flag::reset(self.key.local_initiator),
        ));
        self.shared.mark_reset();
        mux.local_reset(self.key);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.key.id)
            .field("outbound", &self.key.local_initiator)
            .field("state", &self.state())
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}
