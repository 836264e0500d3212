//! Multiplexer session lifecycle.
//!
//! One physical connection, many independent logical streams, deterministic
//! teardown. Three background tasks drive a session: a reader routing
//! inbound frames to per-stream buffers, a writer draining the outbound
//! queue, and an optional keepalive pinger. Whichever of them dies first
//! closes the session for all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::frame::{FrameType, MuxFrame, read_mux_frame, write_mux_frame};
use super::stream::{MuxStream, StreamShared};
use super::{MuxConfig, MuxError};

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the session handle, its streams, and its tasks.
pub(super) struct SessionShared {
    config: MuxConfig,
    state: Mutex<SessionState>,
    next_stream_id: AtomicU32,
    ping_outstanding: AtomicBool,
}

struct SessionState {
    closed: bool,
    /// Dropped on close so the writer task drains and exits.
    out_tx: Option<mpsc::UnboundedSender<MuxFrame>>,
    streams: HashMap<u32, Arc<StreamShared>>,
    on_close: Option<CloseCallback>,
}

impl SessionShared {
    pub(super) fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Queue a frame for the writer task.
    pub(super) fn send(&self, frame: MuxFrame) -> Result<(), MuxError> {
        let tx = {
            let state = self.state.lock().expect("session lock poisoned");
            state.out_tx.clone()
        };
        tx.ok_or(MuxError::SessionClosed)?
            .send(frame)
            .map_err(|_| MuxError::SessionClosed)
    }

    pub(super) fn forget_stream(&self, id: u32) {
        let mut state = self.state.lock().expect("session lock poisoned");
        state.streams.remove(&id);
    }

    fn stream(&self, id: u32) -> Option<Arc<StreamShared>> {
        let state = self.state.lock().expect("session lock poisoned");
        state.streams.get(&id).cloned()
    }

    /// Register a new stream. Returns `None` if the session is closed or
    /// the id is already taken (a protocol violation on inbound SYN).
    fn register_stream(&self, id: u32) -> Option<Arc<StreamShared>> {
        let mut state = self.state.lock().expect("session lock poisoned");
        if state.closed || state.streams.contains_key(&id) {
            return None;
        }
        let shared = Arc::new(StreamShared::new(id, self.config.stream_window));
        state.streams.insert(id, Arc::clone(&shared));
        Some(shared)
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("session lock poisoned").closed
    }

    /// Transition to closed.
    ///
    /// Exactly one caller wins the transition; it resets every stream and
    /// then fires the close callback. The callback runs strictly outside
    /// the session lock: it may well need the caller's own session
    /// registry lock, and holding ours here would invite a deadlock.
    fn close(&self) {
        let (streams, callback) = {
            let mut state = self.state.lock().expect("session lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.out_tx = None;
            (
                state.streams.drain().map(|(_, s)| s).collect::<Vec<_>>(),
                state.on_close.take(),
            )
        };
        for stream in streams {
            stream.reset();
        }
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// One multiplexed session over one connection.
///
/// Created with [`MuxSession::client`] or [`MuxSession::server`]; the only
/// difference is stream-id parity (client-opened streams are odd,
/// server-opened even), so the two sides never collide.
pub struct MuxSession {
    shared: Arc<SessionShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Wrap the initiating side of a connection.
    pub fn client<T>(conn: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, true)
    }

    /// Wrap the accepting side of a connection.
    pub fn server<T>(conn: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, false)
    }

    fn new<T>(conn: T, config: MuxConfig, is_client: bool) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(SessionShared {
            next_stream_id: AtomicU32::new(if is_client { 1 } else { 2 }),
            ping_outstanding: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                closed: false,
                out_tx: Some(out_tx),
                streams: HashMap::new(),
                on_close: None,
            }),
            config,
        });

        tokio::spawn(run_writer(write_half, out_rx, Arc::clone(&shared)));
        tokio::spawn(run_reader(read_half, accept_tx, Arc::clone(&shared)));
        if let Some(interval) = shared.config.keepalive_interval {
            tokio::spawn(run_keepalive(Arc::clone(&shared), interval));
        }

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a new outbound logical stream.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::SessionClosed`] once the session is down.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let stream_shared = self
            .shared
            .register_stream(id)
            .ok_or(MuxError::SessionClosed)?;
        if let Err(err) = self.shared.send(MuxFrame::bare(FrameType::Syn, id)) {
            self.shared.forget_stream(id);
            return Err(err);
        }
        trace!(stream_id = id, "opened mux stream");
        Ok(MuxStream::new(stream_shared, Arc::clone(&self.shared)))
    }

    /// Wait for the next inbound logical stream.
    ///
    /// Returns `None` once the session is closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Register the single-shot close callback.
    ///
    /// The callback fires exactly once, on the first transition to closed,
    /// whether the close is local or a remote EOF — and always outside the
    /// session lock. If the session is already closed, the callback fires
    /// immediately.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending: Option<CloseCallback> = Some(Box::new(callback));
        {
            let mut state = self.shared.state.lock().expect("session lock poisoned");
            if !state.closed {
                state.on_close = pending.take();
            }
        }
        if let Some(callback) = pending {
            callback();
        }
    }

    /// Close the session. Idempotent: a second call is a no-op.
    pub fn close(&self) {
        let _ = self.shared.send(MuxFrame::bare(FrameType::GoAway, 0));
        self.shared.close();
    }

    /// Whether the session has closed, locally or through transport death.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut out_rx: mpsc::UnboundedReceiver<MuxFrame>,
    shared: Arc<SessionShared>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = out_rx.recv().await {
        let last = frame.frame_type == FrameType::GoAway;
        if let Err(err) = write_mux_frame(&mut writer, &frame).await {
            debug!("mux writer stopping: {err}");
            break;
        }
        if last {
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.close();
}

async fn run_reader<R>(
    mut reader: R,
    accept_tx: mpsc::Sender<MuxStream>,
    shared: Arc<SessionShared>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let frame = match read_mux_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!("mux reader stopping: {err}");
                break;
            },
        };
        match frame.frame_type {
            FrameType::Syn => {
                let Some(stream_shared) = shared.register_stream(frame.stream_id) else {
                    // Closed, or duplicate SYN: refuse the stream.
                    let _ = shared.send(MuxFrame::bare(FrameType::Fin, frame.stream_id));
                    shared.forget_stream(frame.stream_id);
                    continue;
                };
                let stream = MuxStream::new(stream_shared, Arc::clone(&shared));
                if let Err(rejected) = accept_tx.try_send(stream) {
                    // Backlog full or accept side gone; dropping the stream
                    // sends FIN and forgets it.
                    debug!(stream_id = frame.stream_id, "rejecting stream, backlog full");
                    drop(rejected);
                }
            },
            FrameType::Data => {
                if let Some(stream) = shared.stream(frame.stream_id) {
                    if !stream.push_data(&frame.payload, shared.config.stream_window) {
                        debug!(stream_id = frame.stream_id, "flow-control violation");
                        break;
                    }
                }
                // Unknown stream: data raced our FIN, drop it.
            },
            FrameType::Fin => {
                if let Some(stream) = shared.stream(frame.stream_id) {
                    stream.set_remote_closed();
                }
            },
            FrameType::Window => match frame.u32_payload() {
                Ok(delta) => {
                    if let Some(stream) = shared.stream(frame.stream_id) {
                        stream.add_credit(delta);
                    }
                },
                Err(err) => {
                    debug!("mux reader stopping: {err}");
                    break;
                },
            },
            FrameType::Ping => {
                let token = frame.u32_payload().unwrap_or(0);
                if shared.send(MuxFrame::pong(token)).is_err() {
                    break;
                }
            },
            FrameType::Pong => {
                shared.ping_outstanding.store(false, Ordering::SeqCst);
            },
            FrameType::GoAway => {
                debug!("peer announced session teardown");
                break;
            },
        }
    }
    shared.close();
}

async fn run_keepalive(shared: Arc<SessionShared>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    let mut token = 0u32;
    loop {
        ticker.tick().await;
        if shared.is_closed() {
            break;
        }
        if shared.ping_outstanding.swap(true, Ordering::SeqCst) {
            // Previous ping went unanswered for a full interval.
            debug!("keepalive timeout, closing session");
            shared.close();
            break;
        }
        token = token.wrapping_add(1);
        if shared.send(MuxFrame::ping(token)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            MuxSession::client(a, MuxConfig::default()),
            MuxSession::server(b, MuxConfig::default()),
        )
    }

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (client, server) = pair();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.expect("inbound stream");
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            // Keep the session alive until the echo lands.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let mut stream = client.open_stream().unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let (client, server) = pair();

        let server_task = tokio::spawn(async move {
            // First stream is accepted and immediately dropped (FIN).
            let first = server.accept_stream().await.expect("first stream");
            drop(first);
            // Second stream still works.
            let mut second = server.accept_stream().await.expect("second stream");
            let mut buf = [0u8; 4];
            second.read_exact(&mut buf).await.unwrap();
            second.write_all(&buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let mut dead = client.open_stream().unwrap();
        let mut live = client.open_stream().unwrap();

        // The dropped stream reads EOF; the sibling is unaffected.
        let mut sink = Vec::new();
        dead.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());

        live.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        live.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn large_transfer_respects_flow_control() {
        let config = MuxConfig {
            stream_window: 64 * 1024,
            frame_payload: 16 * 1024,
            ..MuxConfig::default()
        };
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::client(a, config.clone());
        let server = MuxSession::server(b, config);

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept_stream().await.expect("inbound stream");
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut stream = client.open_stream().unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(10), server_task)
            .await
            .expect("transfer timed out")
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn on_close_fires_exactly_once_and_close_is_idempotent() {
        let (client, _server) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        client.set_on_close(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!client.is_closed());
        client.close();
        client.close(); // no-op
        assert!(client.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_teardown_fires_on_close() {
        let (client, server) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        server.set_on_close(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        client.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !server.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never observed the close");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_registered_after_close_fires_immediately() {
        let (client, _server) = pair();
        client.close();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        client.set_on_close(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_stream_fails_after_close() {
        let (client, _server) = pair();
        client.close();
        assert!(matches!(client.open_stream(), Err(MuxError::SessionClosed)));
    }

    #[tokio::test]
    async fn close_callback_may_take_foreign_locks() {
        // The callback runs outside the session lock, so a callback that
        // grabs an unrelated mutex (as the session registry does) must not
        // deadlock even when the close originates remotely.
        let (client, server) = pair();
        let registry = Arc::new(Mutex::new(vec!["s1"]));
        let registry_clone = Arc::clone(&registry);
        server.set_on_close(move || {
            registry_clone.lock().unwrap().clear();
        });
        client.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("close callback never ran");
    }
}
