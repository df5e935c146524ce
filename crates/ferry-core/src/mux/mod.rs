//! Stream multiplexer (`/mplex/6.7.0`).
//!
//! Many independent byte streams share one secured connection:
//!
//! - a single **reader task** owns the read half, decodes frames and
//!   dispatches payloads into per-stream bounded queues without ever
//!   waiting on one stream;
//! - a single **writer task** owns the write half and serializes frames
//!   coming from every stream through one bounded queue;
//! - remotely opened streams wait in a bounded incoming queue until
//!   [`Multiplexer::accept_stream`] takes them.
//!
//! A stream whose receive queue overflows is reset on its own; sibling
//! streams keep flowing. A malformed frame, a read or write failure, or
//! [`Multiplexer::close`] tears the whole connection down and wakes every
//! pending read with `ConnectionClosed`.

mod allocator;
mod frame;
mod stream;

pub use allocator::StreamIdAllocator;
pub use frame::{Flag, Frame};
pub use stream::{Stream, StreamState};

use crate::config::MuxConfig;
use crate::error::{MultiplexError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use stream::StreamShared;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Bytes the writer batches before flushing
const WRITE_BATCH: usize = 64 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Stream identity on one connection: its number plus which side opened it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    pub(crate) id: u64,
    pub(crate) local_initiator: bool,
}

/// Multiplexer bookkeeping for one live stream
struct Slot {
    /// Sender into the stream's receive queue; dropped on remote close
    tx: Option<mpsc::Sender<Vec<u8>>>,
    local_closed: bool,
    remote_closed: bool,
    stream: Arc<StreamShared>,
}

struct MuxState {
    streams: HashMap<StreamKey, Slot>,
    allocator: StreamIdAllocator,
}

/// State shared between the multiplexer handle, its tasks and its streams
pub(crate) struct MuxShared {
    config: MuxConfig,
    outbound: mpsc::Sender<Frame>,
    state: Mutex<MuxState>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl MuxShared {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<Frame> {
        &self.outbound
    }

    /// Queue a control frame without waiting. Used from the reader task and
    /// from `Drop`, neither of which may block on the writer.
    pub(crate) fn send_control(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let outbound = self.outbound.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn reap(state: &mut MuxState, key: StreamKey) {
        if state.streams.remove(&key).is_some() && key.local_initiator {
            state.allocator.release(key.id);
        }
    }

    /// Local side sent its close frame
    pub(crate) fn local_closed(&self, key: StreamKey) {
        let mut state = self.lock();
        let Some(slot) = state.streams.get_mut(&key) else {
            return;
        };
        slot.local_closed = true;
        if slot.remote_closed {
            Self::reap(&mut state, key);
        }
    }

    /// Local side reset the stream (or dropped it unfinished)
    pub(crate) fn local_reset(&self, key: StreamKey) {
        Self::reap(&mut self.lock(), key);
    }

    fn on_new_stream(self: &Arc<Self>, id: u64, incoming: &mpsc::Sender<Stream>) {
        let key = StreamKey {
            id,
            local_initiator: false,
        };
        let (tx, rx) = mpsc::channel(self.config.max_buffered_frames);
        let shared = Arc::new(StreamShared::new(StreamState::Open));

        {
            let mut state = self.lock();
            if self.is_closed() {
                return;
            }
            if state.streams.contains_key(&key) {
                tracing::warn!("Peer reopened live stream {}, ignoring", id);
                return;
            }
            if state.streams.len() >= self.config.max_streams {
                drop(state);
                tracing::warn!(
                    "Stream limit {} reached, refusing stream {}",
                    self.config.max_streams,
                    id
                );
                self.send_control(Frame::control(id, Flag::reset(false)));
                return;
            }
            state.streams.insert(
                key,
                Slot {
                    tx: Some(tx),
                    local_closed: false,
                    remote_closed: false,
                    stream: Arc::clone(&shared),
                },
            );
        }

        let stream = Stream::new(Arc::downgrade(self), key, shared, rx);
        match incoming.try_send(stream) {
            Ok(()) => tracing::trace!("Inbound stream {} queued", id),
            Err(e) => {
                tracing::warn!("Incoming stream queue full, resetting stream {}", id);
                // Dropping the unaccepted stream resets it
                drop(e);
            }
        }
    }

    fn on_message(&self, key: StreamKey, payload: Vec<u8>) {
        let mut state = self.lock();
        let Some(tx) = state.streams.get(&key).and_then(|slot| slot.tx.as_ref()) else {
            tracing::trace!("Dropping data for unknown stream {}", key.id);
            return;
        };

        match tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Local side stopped reading; discard
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Receive buffer of stream {} full, resetting it", key.id);
                if let Some(slot) = state.streams.get(&key) {
                    slot.stream.mark_reset();
                }
                Self::reap(&mut state, key);
                drop(state);
                self.send_control(Frame::control(key.id, Flag::reset(key.local_initiator)));
            }
        }
    }

    fn on_remote_close(&self, key: StreamKey) {
        let mut state = self.lock();
        let Some(slot) = state.streams.get_mut(&key) else {
            return;
        };
        tracing::trace!("Stream {} closed by remote", key.id);
        slot.remote_closed = true;
        slot.stream.on_remote_close();
        slot.tx = None;
        if slot.local_closed {
            Self::reap(&mut state, key);
        }
    }

    fn on_remote_reset(&self, key: StreamKey) {
        let mut state = self.lock();
        if let Some(slot) = state.streams.get(&key) {
            tracing::debug!("Stream {} reset by remote", key.id);
            slot.stream.mark_reset();
        }
        Self::reap(&mut state, key);
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, incoming: &mpsc::Sender<Stream>) {
        let key = StreamKey {
            id: frame.stream_id,
            local_initiator: !frame.flag.sent_by_initiator(),
        };
        match frame.flag {
            Flag::NewStream => self.on_new_stream(frame.stream_id, incoming),
            Flag::MessageInitiator | Flag::MessageReceiver => self.on_message(key, frame.payload),
            Flag::CloseInitiator | Flag::CloseReceiver => self.on_remote_close(key),
            Flag::ResetInitiator | Flag::ResetReceiver => self.on_remote_reset(key),
        }
    }

    /// Close the connection: every stream is closed and every pending read
    /// wakes with `ConnectionClosed`. Idempotent.
    fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams = std::mem::take(&mut self.lock().streams);
        tracing::debug!("Multiplexer closing with {} open streams", streams.len());
        for slot in streams.into_values() {
            slot.stream.on_connection_closed();
        }
        self.shutdown.notify_one();
    }
}

/// Multiplexer over one secured connection
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    reader: JoinHandle<()>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Start multiplexing over `io`. Spawns the reader and writer tasks, so
    /// this must be called inside a Tokio runtime.
    pub fn new<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_queue);

        let shared = Arc::new(MuxShared {
            config,
            outbound: outbound_tx,
            state: Mutex::new(MuxState {
                streams: HashMap::new(),
                allocator: StreamIdAllocator::new(),
            }),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared), incoming_tx));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&shared)));

        Self {
            shared,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            reader,
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }

    /// Open a new outbound stream.
    ///
    /// # Errors
    ///
    /// - [`MultiplexError::TooManyStreams`] at the configured limit
    /// - [`MultiplexError::ConnectionClosed`] if the connection is gone
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.shared.is_closed() {
            return Err(MultiplexError::ConnectionClosed.into());
        }

        let (tx, rx) = mpsc::channel(self.shared.config.max_buffered_frames);
        let stream_shared = Arc::new(StreamShared::new(StreamState::Init));
        let key = {
            let mut state = self.shared.lock();
            if self.shared.is_closed() {
                return Err(MultiplexError::ConnectionClosed.into());
            }
            if state.streams.len() >= self.shared.config.max_streams {
                return Err(MultiplexError::TooManyStreams(self.shared.config.max_streams).into());
            }
            let key = StreamKey {
                id: state.allocator.allocate(),
                local_initiator: true,
            };
            state.streams.insert(
                key,
                Slot {
                    tx: Some(tx),
                    local_closed: false,
                    remote_closed: false,
                    stream: Arc::clone(&stream_shared),
                },
            );
            key
        };

        let stream = Stream::new(Arc::downgrade(&self.shared), key, stream_shared, rx);
        let name = key.id.to_string().into_bytes();
        if self
            .shared
            .outbound
            .send(Frame::new(key.id, Flag::NewStream, name))
            .await
            .is_err()
        {
            return Err(MultiplexError::ConnectionClosed.into());
        }
        stream.mark_open();
        tracing::debug!("Opened stream {}", key.id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the remote.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::ConnectionClosed`] once the connection is
    /// gone and no queued stream is left.
    pub async fn accept_stream(&self) -> Result<Stream> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MultiplexError::ConnectionClosed.into())
    }

    /// Number of live streams (both directions)
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.shared.lock().streams.len()
    }

    /// True once the connection is torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Tear the connection down. Queued frames are still flushed by the
    /// writer before it closes the write half. Idempotent.
    pub fn close(&self) {
        self.shared.teardown();
        self.reader.abort();
    }

    /// Close and wait until the writer has flushed and shut down.
    pub async fn close_and_wait(&self) {
        self.close();
        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.await;
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("streams", &self.stream_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<MuxShared>, incoming: mpsc::Sender<Stream>)
where
    R: AsyncRead + Unpin,
{
    let max_payload = shared.config.max_frame_len;
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match Frame::decode(&buf, max_payload) {
            Ok(Some((frame, used))) => {
                buf.drain(..used);
                shared.dispatch(frame, &incoming);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("{}, closing connection", e);
                break;
            }
        }

        match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!("Connection closed by remote");
                break;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::debug!("Connection read failed: {}", e);
                break;
            }
        }
    }

    shared.teardown();
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Frame>, shared: Arc<MuxShared>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(WRITE_BATCH);

    loop {
        let next = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            () = shared.shutdown.notified() => None,
        };
        let Some(frame) = next else {
            break;
        };

        frame.encode(&mut buf);
        while buf.len() < WRITE_BATCH {
            match outbound.try_recv() {
                Ok(frame) => frame.encode(&mut buf),
                Err(_) => break,
            }
        }

        if let Err(e) = writer.write_all(&buf).await {
            tracing::debug!("Connection write failed: {}", e);
            break;
        }
        buf.clear();
        if let Err(e) = writer.flush().await {
            tracing::debug!("Connection flush failed: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
    shared.teardown();
}
