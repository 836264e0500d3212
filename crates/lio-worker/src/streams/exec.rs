//! Generic command execution over a stream.
//!
//! Outbound data frames carry the child's interleaved stdout/stderr;
//! inbound data frames feed its stdin. The stream ends with a result frame
//! carrying the exit status, then a close frame. If the peer closes first,
//! the child is killed.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use lio_core::relay::{self, RelayFrame, ResultFrame};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{pump_reader, spawn_close_watcher};
use crate::registry::{HandlerError, StreamContext, StreamHandler};

#[derive(Debug, Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// "exec" stream handler.
pub struct ExecStream;

#[async_trait]
impl StreamHandler for ExecStream {
    async fn run(&self, ctx: StreamContext) -> Result<(), HandlerError> {
        let StreamContext {
            stream,
            stream_id,
            args,
            cancel,
            ..
        } = ctx;
        let (reader_half, mut writer_half) = tokio::io::split(stream);

        let params: ExecArgs = match serde_json::from_value(args) {
            Ok(params) => params,
            Err(err) => {
                let message = format!("bad exec arguments: {err}");
                let _ = relay::write_result_error(&mut writer_half, stream_id, 400, &message).await;
                return Err(HandlerError::bad_request(message));
            },
        };

        let mut command = Command::new(&params.command);
        command
            .args(&params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to spawn {}: {err}", params.command);
                let _ = relay::write_result_error(&mut writer_half, stream_id, 500, &message).await;
                return Err(HandlerError::internal(message));
            },
        };
        debug!(command = %params.command, pid = child.id(), "exec child spawned");

        // Inbound data frames feed the child's stdin; the channel closes
        // with the watcher, which closes the child's stdin in turn.
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Bytes>();
        let watcher = spawn_close_watcher(
            reader_half,
            cancel.clone(),
            Some(Box::new(move |chunk| {
                let _ = stdin_tx.send(chunk);
            })),
        );
        let mut stdin = child.stdin.take();
        let stdin_task = tokio::spawn(async move {
            while let Some(chunk) = stdin_rx.recv().await {
                let Some(pipe) = stdin.as_mut() else { break };
                if pipe.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            drop(stdin);
        });

        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_reader(stdout, out_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_reader(stderr, out_tx.clone()));
        }
        drop(out_tx);

        let mut killed = false;
        loop {
            tokio::select! {
                () = cancel.cancelled(), if !killed => {
                    killed = true;
                    let _ = child.start_kill();
                },
                chunk = out_rx.recv() => match chunk {
                    Some(bytes) => {
                        if relay::write_frame(&mut writer_half, &RelayFrame::data(stream_id, bytes))
                            .await
                            .is_err()
                        {
                            // Peer unreachable; kill and keep draining so
                            // the child is reaped.
                            killed = true;
                            let _ = child.start_kill();
                        }
                    },
                    None => break,
                },
            }
        }

        let status = child.wait().await;
        stdin_task.abort();
        watcher.abort();

        match status {
            Ok(status) if !killed => {
                let result = ResultFrame::ok(json!({
                    "exit_code": status.code(),
                    "signal": status.signal(),
                }));
                let _ = relay::write_result(&mut writer_half, stream_id, &result).await;
            },
            _ => {
                let _ = relay::write_result_error(&mut writer_half, stream_id, 500, "command terminated")
                    .await;
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

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
            session_id: "s-exec".into(),
            username: "alice".into(),
            server_base_url: String::new(),
            server_cert: String::new(),
        })
    }

    /// A connected (client stream, server stream) pair plus the sessions
    /// keeping them alive.
    async fn stream_pair() -> (MuxStream, MuxStream, MuxSession, MuxSession) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::client(near, MuxConfig::default());
        let server = MuxSession::server(far, MuxConfig::default());
        let client_stream = client.open_stream().unwrap();
        let server_stream = server.accept_stream().await.unwrap();
        (client_stream, server_stream, client, server)
    }

    fn stream_ctx(stream: MuxStream, args: serde_json::Value) -> StreamContext {
        StreamContext {
            worker: test_context(),
            stream,
            stream_id: 1,
            command: "run".into(),
            args,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn command_output_and_exit_status_are_relayed() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let args = json!({"command": "/bin/sh", "args": ["-c", "printf hello"]});
        let handler = tokio::spawn(async move { ExecStream.run(stream_ctx(server_stream, args)).await });

        let mut output = Vec::new();
        let result = loop {
            let frame = relay::read_frame(&mut client_stream).await.unwrap();
            match frame.opcode {
                Opcode::Data => output.extend_from_slice(&frame.payload),
                Opcode::Result => {
                    break serde_json::from_slice::<ResultFrame>(&frame.payload).unwrap();
                },
                Opcode::Close => panic!("close before result"),
            }
        };
        let close = relay::read_frame(&mut client_stream).await.unwrap();

        assert_eq!(output, b"hello");
        assert!(result.is_ok());
        assert_eq!(result.data["exit_code"], json!(0));
        assert_eq!(close.opcode, Opcode::Close);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let args = json!({"command": "/bin/cat"});
        let handler = tokio::spawn(async move { ExecStream.run(stream_ctx(server_stream, args)).await });

        relay::write_frame(&mut client_stream, &RelayFrame::data(1, &b"echoed"[..]))
            .await
            .unwrap();

        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            relay::read_frame(&mut client_stream),
        )
        .await
        .expect("no output from cat")
        .unwrap();
        assert_eq!(frame.opcode, Opcode::Data);
        assert_eq!(&frame.payload[..], b"echoed");

        // Closing our side ends cat and the handler.
        relay::write_close(&mut client_stream, 1).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .expect("handler did not finish after close")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn peer_close_kills_the_subprocess() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let args = json!({"command": "/bin/sleep", "args": ["30"]});
        let ctx = stream_ctx(server_stream, args);
        let cancel = ctx.cancel.clone();
        let handler = tokio::spawn(async move { ExecStream.run(ctx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        relay::write_close(&mut client_stream, 1).await.unwrap();

        // The close must cancel the context and kill the child well before
        // the sleep could finish on its own.
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("close frame never cancelled the handler context");
        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .expect("handler still running, child was not killed")
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn bad_arguments_yield_a_result_error() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let handler = tokio::spawn(async move { ExecStream.run(stream_ctx(server_stream, json!({"nope": 1}))).await });

        let frame = relay::read_frame(&mut client_stream).await.unwrap();
        assert_eq!(frame.opcode, Opcode::Result);
        let result: ResultFrame = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(result.code, 400);
        assert!(handler.await.unwrap().is_err());
    }
}
