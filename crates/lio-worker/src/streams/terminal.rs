//! Interactive terminal over a stream.
//!
//! Allocates a PTY, spawns the user's shell on it, and relays bytes both
//! ways: inbound data frames become keystrokes, PTY output becomes
//! outbound data frames. A raw byte stream: when the shell exits or the
//! peer closes, the handler emits a close frame alone — no structured
//! result.
//!
//! The PTY's blocking reader/writer run on dedicated threads bridged to
//! the async side with channels; portable-pty exposes no async I/O.

use async_trait::async_trait;
use bytes::Bytes;
use lio_core::relay::{self, RelayFrame};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::spawn_close_watcher;
use crate::registry::{HandlerError, StreamContext, StreamHandler};

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Deserialize)]
struct TerminalArgs {
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
    /// Program to run on the PTY; the user's shell when absent.
    #[serde(default)]
    shell: Option<String>,
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// "terminal" stream handler.
pub struct TerminalStream;

#[async_trait]
impl StreamHandler for TerminalStream {
    async fn run(&self, ctx: StreamContext) -> Result<(), HandlerError> {
        let StreamContext {
            worker,
            stream,
            stream_id,
            args,
            cancel,
            ..
        } = ctx;
        let (reader_half, mut writer_half) = tokio::io::split(stream);

        let params: TerminalArgs = match serde_json::from_value(args) {
            Ok(params) => params,
            Err(err) => {
                let message = format!("bad terminal arguments: {err}");
                let _ = relay::write_result_error(&mut writer_half, stream_id, 400, &message).await;
                return Err(HandlerError::bad_request(message));
            },
        };
        let shell = params.shell.clone().unwrap_or_else(default_shell);

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows: params.rows,
            cols: params.cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(err) => {
                let message = format!("failed to open PTY: {err}");
                let _ = relay::write_result_error(&mut writer_half, stream_id, 500, &message).await;
                return Err(HandlerError::internal(message));
            },
        };

        let child = match pair.slave.spawn_command(CommandBuilder::new(&shell)) {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to spawn {shell}: {err}");
                let _ = relay::write_result_error(&mut writer_half, stream_id, 500, &message).await;
                return Err(HandlerError::internal(message));
            },
        };
        // The master keeps the PTY; the slave belongs to the child now.
        drop(pair.slave);
        debug!(shell = %shell, "terminal session started");

        let mut killer = child.clone_killer();
        {
            // Full worker teardown kills the PTY; logout leaves it to the
            // orchestrator's own cleanup.
            let mut hook_killer = child.clone_killer();
            worker
                .resources
                .register("pty", true, Box::new(move || {
                    let _ = hook_killer.kill();
                }));
        }

        let master = pair.master;
        let (mut pty_writer, pty_reader) = match (master.take_writer(), master.try_clone_reader()) {
            (Ok(writer), Ok(reader)) => (writer, reader),
            (Err(err), _) | (_, Err(err)) => {
                let message = format!("failed to attach to PTY: {err}");
                let _ = relay::write_result_error(&mut writer_half, stream_id, 500, &message).await;
                return Err(HandlerError::internal(message));
            },
        };

        // Keystrokes: relay data frames -> blocking PTY writer thread.
        let (stdin_tx, stdin_rx) = std::sync::mpsc::channel::<Bytes>();
        std::thread::spawn(move || {
            use std::io::Write;
            for chunk in stdin_rx {
                if pty_writer.write_all(&chunk).is_err() {
                    break;
                }
                let _ = pty_writer.flush();
            }
        });
        let watcher = spawn_close_watcher(
            reader_half,
            cancel.clone(),
            Some(Box::new(move |chunk| {
                let _ = stdin_tx.send(chunk);
            })),
        );

        // PTY output: blocking reader thread -> async channel.
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(16);
        std::thread::spawn(move || {
            use std::io::Read;
            let mut reader = pty_reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    },
                }
            }
        });

        let mut killed = false;
        loop {
            tokio::select! {
                () = cancel.cancelled(), if !killed => {
                    killed = true;
                    let _ = killer.kill();
                },
                chunk = out_rx.recv() => match chunk {
                    Some(bytes) => {
                        if relay::write_frame(&mut writer_half, &RelayFrame::data(stream_id, bytes))
                            .await
                            .is_err()
                        {
                            killed = true;
                            let _ = killer.kill();
                        }
                    },
                    None => break, // PTY EOF: the shell exited
                },
            }
        }

        let _ = killer.kill();
        let _ = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        })
        .await;

        let _ = relay::write_close(&mut writer_half, stream_id).await;
        watcher.abort();
        drop(master);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use lio_core::Bootstrap;
    use lio_core::mux::{MuxConfig, MuxSession, MuxStream};
    use lio_core::relay::Opcode;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::context::WorkerContext;

    fn test_context() -> Arc<WorkerContext> {
        WorkerContext::new(Bootstrap {
            uid: 1000,
            gid: 1000,
            verbose: false,
            privileged: false,
            env_mode: 0,
            log_fd: -1,
            session_id: "s-term".into(),
            username: "alice".into(),
            server_base_url: String::new(),
            server_cert: String::new(),
        })
    }

    async fn stream_pair() -> (MuxStream, MuxStream, MuxSession, MuxSession) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::client(near, MuxConfig::default());
        let server = MuxSession::server(far, MuxConfig::default());
        let client_stream = client.open_stream().unwrap();
        let server_stream = server.accept_stream().await.unwrap();
        (client_stream, server_stream, client, server)
    }

    #[tokio::test]
    async fn short_lived_shell_ends_with_close() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let ctx = StreamContext {
            worker: test_context(),
            stream: server_stream,
            stream_id: 1,
            command: "open".into(),
            args: json!({"shell": "/bin/true", "cols": 80, "rows": 24}),
            cancel: CancellationToken::new(),
        };
        let handler = tokio::spawn(async move { TerminalStream.run(ctx).await });

        // Drain whatever the PTY produced; the stream must end in a close.
        let deadline = Duration::from_secs(10);
        let closed = tokio::time::timeout(deadline, async {
            loop {
                match relay::read_frame(&mut client_stream).await {
                    Ok(frame) if frame.opcode == Opcode::Close => break true,
                    Ok(_) => {},
                    Err(_) => break false,
                }
            }
        })
        .await
        .expect("terminal stream never closed");
        assert!(closed);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_kills_the_shell() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let ctx = StreamContext {
            worker: test_context(),
            stream: server_stream,
            stream_id: 1,
            // cat never exits on its own; only the kill can end it.
            command: "open".into(),
            args: json!({"shell": "/bin/cat"}),
            cancel: CancellationToken::new(),
        };
        let handler = tokio::spawn(async move { TerminalStream.run(ctx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        relay::write_close(&mut client_stream, 1).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), handler)
            .await
            .expect("handler still running, shell was not killed")
            .unwrap()
            .unwrap();
    }
}
