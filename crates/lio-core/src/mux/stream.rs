//! One logical stream over a multiplexer session.
//!
//! A [`MuxStream`] implements `AsyncRead`/`AsyncWrite`, so relay frames and
//! `tokio::io` utilities work on it unchanged. Reads drain a buffer the
//! session's reader task fills; writes spend flow-control credit the peer
//! replenishes with window updates, so one saturated stream parks its
//! writer without starving siblings.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::frame::MuxFrame;
use super::session::SessionShared;

/// Per-stream state shared between the stream handle and the session's
/// reader task.
pub(super) struct StreamShared {
    pub(super) id: u32,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    read_buf: BytesMut,
    /// Peer sent FIN (or the session died); reads drain then return EOF.
    remote_closed: bool,
    /// We sent FIN; further writes fail.
    local_closed: bool,
    /// Session torn down underneath the stream.
    reset: bool,
    /// Bytes we may still send before the peer grants more credit.
    send_credit: u32,
    /// Bytes consumed locally since the last window update we sent.
    consumed_since_update: u32,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamShared {
    pub(super) fn new(id: u32, initial_credit: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner {
                read_buf: BytesMut::new(),
                remote_closed: false,
                local_closed: false,
                reset: false,
                send_credit: initial_credit,
                consumed_since_update: 0,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    /// Append inbound payload. Returns `false` on a flow-control violation
    /// (peer wrote far past its window), which tears the session down.
    pub(super) fn push_data(&self, payload: &[u8], window: u32) -> bool {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        if inner.remote_closed || inner.reset {
            // Late data after FIN/reset: drop silently.
            return true;
        }
        if inner.read_buf.len() + payload.len() > (window as usize).saturating_mul(2) {
            return false;
        }
        inner.read_buf.extend_from_slice(payload);
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        true
    }

    pub(super) fn set_remote_closed(&self) {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        inner.remote_closed = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }

    pub(super) fn add_credit(&self, delta: u32) {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        inner.send_credit = inner.send_credit.saturating_add(delta);
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
    }

    /// Session died: wake everything, fail all further I/O.
    pub(super) fn reset(&self) {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        inner.reset = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
    }
}

/// Handle to one logical stream.
///
/// Dropping the handle half-closes the stream (FIN) and forgets it on the
/// session; the peer's own FIN is what ends the read side.
pub struct MuxStream {
    shared: Arc<StreamShared>,
    session: Arc<SessionShared>,
    /// FIN already sent through shutdown, so Drop must not repeat it.
    fin_sent: AtomicBool,
}

impl MuxStream {
    pub(super) fn new(shared: Arc<StreamShared>, session: Arc<SessionShared>) -> Self {
        Self {
            shared,
            session,
            fin_sent: AtomicBool::new(false),
        }
    }

    /// Stream id on the wire.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    fn send_fin_once(&self) {
        if !self.fin_sent.swap(true, Ordering::SeqCst) {
            let _ = self
                .session
                .send(MuxFrame::bare(super::frame::FrameType::Fin, self.shared.id));
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let window_update = {
            let mut inner = self.shared.inner.lock().expect("stream lock poisoned");
            if inner.read_buf.is_empty() {
                if inner.remote_closed {
                    return Poll::Ready(Ok(())); // EOF
                }
                if inner.reset {
                    return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                }
                inner.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = buf.remaining().min(inner.read_buf.len());
            let chunk = inner.read_buf.split_to(n);
            buf.put_slice(&chunk);
            #[allow(clippy::cast_possible_truncation)]
            {
                inner.consumed_since_update = inner.consumed_since_update.saturating_add(n as u32);
            }
            if inner.consumed_since_update >= self.session.config().stream_window / 2 {
                let delta = inner.consumed_since_update;
                inner.consumed_since_update = 0;
                Some(delta)
            } else {
                None
            }
        };
        // Replenish the peer's credit outside the stream lock.
        if let Some(delta) = window_update {
            let _ = self.session.send(MuxFrame::window(self.shared.id, delta));
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = {
            let mut inner = self.shared.inner.lock().expect("stream lock poisoned");
            if inner.local_closed {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            if inner.reset {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            if inner.send_credit == 0 {
                inner.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let n = buf
                .len()
                .min(inner.send_credit as usize)
                .min(self.session.config().frame_payload as usize);
            #[allow(clippy::cast_possible_truncation)]
            {
                inner.send_credit -= n as u32;
            }
            n
        };
        match self
            .session
            .send(MuxFrame::data(self.shared.id, Bytes::copy_from_slice(&buf[..n])))
        {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer on poll_write; there is
        // no stream-local buffer to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        {
            let mut inner = self.shared.inner.lock().expect("stream lock poisoned");
            inner.local_closed = true;
        }
        self.send_fin_once();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.send_fin_once();
        self.session.forget_stream(self.shared.id);
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.shared.id).finish()
    }
}
