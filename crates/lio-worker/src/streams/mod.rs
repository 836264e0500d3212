//! Interactive stream handlers.
//!
//! Each handler owns its logical stream for the stream's entire lifetime
//! and is responsible for the full frame discipline: emitting data frames,
//! the terminal result/close, and detecting the peer's close so background
//! work (a PTY, a followed subprocess) is torn down promptly.
//!
//! The shared pattern: the handler splits its stream, hands the read half
//! to [`spawn_close_watcher`], and pairs all work with the stream's
//! cancellation token. The watcher forwards inbound data payloads (stdin
//! bytes, upload chunks) and cancels the token on a close frame or a read
//! error — either way, whatever the handler started must die.

pub mod exec;
pub mod file;
pub mod logs;
pub mod terminal;

pub use exec::ExecStream;
pub use file::FileStream;
pub use logs::LogsStream;
pub use terminal::TerminalStream;

use bytes::Bytes;
use lio_core::mux::MuxStream;
use lio_core::relay::{self, Opcode};
use tokio::io::ReadHalf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Inbound data callback for [`spawn_close_watcher`].
pub(crate) type DataSink = Box<dyn FnMut(Bytes) + Send>;

/// Watch the read half of a stream for the peer's close.
///
/// Data payloads are forwarded to `on_data` (if any); a close frame or a
/// read error cancels `cancel`, which is the signal the owning handler
/// uses to kill its subprocess and unwind.
pub(crate) fn spawn_close_watcher(
    mut reader: ReadHalf<MuxStream>,
    cancel: CancellationToken,
    mut on_data: Option<DataSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match relay::read_frame(&mut reader).await {
                Ok(frame) => match frame.opcode {
                    Opcode::Data => {
                        if let Some(sink) = on_data.as_mut() {
                            sink(frame.payload);
                        }
                    },
                    Opcode::Close => break,
                    // Initiators do not send results to handlers.
                    Opcode::Result => {},
                },
                Err(_) => break,
            }
        }
        cancel.cancel();
    })
}

/// Pump an async byte source into a bounded channel until EOF or error.
pub(crate) async fn pump_reader<R>(mut source: R, tx: tokio::sync::mpsc::Sender<Bytes>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            },
        }
    }
}
