//! Byte-flipping wrapper for wire tampering tests

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Wraps an I/O object and, once armed, flips the last bit of the next
/// write. Reads pass through untouched.
pub struct TamperIo<T> {
    inner: T,
    armed: Arc<AtomicBool>,
}

impl<T> TamperIo<T> {
    /// Wrap `inner`; the returned flag arms the tamper when set.
    pub fn new(inner: T) -> (Self, Arc<AtomicBool>) {
        let armed = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                armed: Arc::clone(&armed),
            },
            armed,
        )
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for TamperIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TamperIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() || !self.armed.load(Ordering::SeqCst) {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }

        let mut corrupted = buf.to_vec();
        if let Some(last) = corrupted.last_mut() {
            *last ^= 0x01;
        }
        let result = Pin::new(&mut self.inner).poll_write(cx, &corrupted);
        // Only disarm once the flipped byte actually went out
        if let Poll::Ready(Ok(n)) = result {
            if n == corrupted.len() {
                self.armed.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
