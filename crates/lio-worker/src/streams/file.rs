//! File transfer over a stream.
//!
//! Two commands under the "file" stream type:
//!
//! - `send` (worker → orchestrator): the file's bytes as raw data frames,
//!   ended by a close frame alone.
//! - `receive` (orchestrator → worker): inbound data frames are appended
//!   to the destination file while progress ticks flow back; the peer's
//!   close frame marks end of input, answered with a result frame carrying
//!   the byte count, then a close frame.

use async_trait::async_trait;
use lio_core::mux::MuxStream;
use lio_core::relay::{self, Opcode, ProgressTick, RelayFrame, ResultFrame};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::registry::{HandlerError, StreamContext, StreamHandler};

/// Read chunk for outbound transfers.
const SEND_CHUNK: usize = 256 * 1024;

/// Emit a progress tick at least every this many received bytes.
const PROGRESS_STEP: u64 = 256 * 1024;

#[derive(Debug, Deserialize)]
struct FileArgs {
    path: String,
    /// Expected total size for `receive`; 0 percent is reported without it.
    #[serde(default)]
    size: Option<u64>,
}

/// "file" stream handler.
pub struct FileStream;

#[async_trait]
impl StreamHandler for FileStream {
    async fn run(&self, ctx: StreamContext) -> Result<(), HandlerError> {
        let StreamContext {
            stream,
            stream_id,
            command,
            args,
            cancel,
            ..
        } = ctx;
        let mut stream = stream;

        let params: FileArgs = match serde_json::from_value(args) {
            Ok(params) => params,
            Err(err) => {
                let message = format!("bad file arguments: {err}");
                let _ = relay::write_result_error(&mut stream, stream_id, 400, &message).await;
                return Err(HandlerError::bad_request(message));
            },
        };

        match command.as_str() {
            "send" => send(stream, stream_id, &params, cancel).await,
            "receive" => receive(stream, stream_id, &params, cancel).await,
            other => {
                let message = format!("unknown file command {other}");
                let _ = relay::write_result_error(&mut stream, stream_id, 400, &message).await;
                Err(HandlerError::bad_request(message))
            },
        }
    }
}

async fn send(
    mut stream: MuxStream,
    stream_id: u32,
    params: &FileArgs,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), HandlerError> {
    let mut file = match tokio::fs::File::open(&params.path).await {
        Ok(file) => file,
        Err(err) => {
            let code = if err.kind() == std::io::ErrorKind::NotFound { 404 } else { 500 };
            let message = format!("cannot open {}: {err}", params.path);
            let _ = relay::write_result_error(&mut stream, stream_id, code, &message).await;
            return Err(HandlerError {
                code,
                message,
            });
        },
    };
    debug!(path = %params.path, "file send starting");

    let mut buf = vec![0u8; SEND_CHUNK];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            read = file.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let frame = RelayFrame::data(stream_id, bytes::Bytes::copy_from_slice(&buf[..n]));
                    if relay::write_frame(&mut stream, &frame).await.is_err() {
                        // Partial frame possible: abandon, do not retry.
                        return Ok(());
                    }
                },
                Err(err) => {
                    let _ = relay::write_result_error(
                        &mut stream,
                        stream_id,
                        500,
                        format!("read failed: {err}"),
                    )
                    .await;
                    return Ok(());
                },
            },
        }
    }
    let _ = relay::write_close(&mut stream, stream_id).await;
    Ok(())
}

async fn receive(
    mut stream: MuxStream,
    stream_id: u32,
    params: &FileArgs,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), HandlerError> {
    let mut file = match tokio::fs::File::create(&params.path).await {
        Ok(file) => file,
        Err(err) => {
            let message = format!("cannot create {}: {err}", params.path);
            let _ = relay::write_result_error(&mut stream, stream_id, 500, &message).await;
            return Err(HandlerError::internal(message));
        },
    };
    debug!(path = %params.path, expected = ?params.size, "file receive starting");

    let total = params.size.unwrap_or(0);
    let mut written: u64 = 0;
    let mut since_tick: u64 = 0;

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                // Worker shutdown mid-transfer: abandon the stream.
                return Ok(());
            },
            frame = relay::read_frame(&mut stream) => match frame {
                Ok(frame) => frame,
                Err(_) => return Ok(()), // transport died; partial file remains
            },
        };
        match frame.opcode {
            Opcode::Data => {
                if let Err(err) = file.write_all(&frame.payload).await {
                    let _ = relay::write_result_error(
                        &mut stream,
                        stream_id,
                        500,
                        format!("write failed: {err}"),
                    )
                    .await;
                    return Ok(());
                }
                written += frame.payload.len() as u64;
                since_tick += frame.payload.len() as u64;
                if since_tick >= PROGRESS_STEP {
                    since_tick = 0;
                    let _ = write_tick(&mut stream, stream_id, written, total).await;
                }
            },
            Opcode::Close => break,
            Opcode::Result => {},
        }
    }

    if file.flush().await.is_err() {
        let _ = relay::write_result_error(&mut stream, stream_id, 500, "flush failed").await;
        return Ok(());
    }
    // Final tick so short transfers still report completion.
    let _ = write_tick(&mut stream, stream_id, written, total).await;
    let _ = relay::write_result(
        &mut stream,
        stream_id,
        &ResultFrame::ok(json!({ "bytes_written": written })),
    )
    .await;
    Ok(())
}

async fn write_tick(
    stream: &mut MuxStream,
    stream_id: u32,
    written: u64,
    total: u64,
) -> lio_core::ProtocolResult<()> {
    #[allow(clippy::cast_precision_loss)]
    let percent = if total > 0 {
        (written as f64 / total as f64 * 100.0).min(100.0)
    } else {
        0.0
    };
    let tick = ProgressTick {
        percent,
        bytes_processed: written,
        total_bytes: total,
    };
    let payload = serde_json::to_vec(&tick)
        .map_err(|err| lio_core::ProtocolError::invalid_frame(err.to_string()))?;
    relay::write_frame(stream, &RelayFrame::data(stream_id, payload)).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use lio_core::Bootstrap;
    use lio_core::mux::{MuxConfig, MuxSession};
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
            session_id: "s-file".into(),
            username: "alice".into(),
            server_base_url: String::new(),
            server_cert: String::new(),
        })
    }

    async fn stream_pair() -> (MuxStream, MuxStream, MuxSession, MuxSession) {
        let (near, far) = tokio::io::duplex(1024 * 1024);
        let client = MuxSession::client(near, MuxConfig::default());
        let server = MuxSession::server(far, MuxConfig::default());
        let client_stream = client.open_stream().unwrap();
        let server_stream = server.accept_stream().await.unwrap();
        (client_stream, server_stream, client, server)
    }

    #[tokio::test]
    async fn receive_writes_file_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("upload.bin");
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;

        let ctx = StreamContext {
            worker: test_context(),
            stream: server_stream,
            stream_id: 1,
            command: "receive".into(),
            args: json!({"path": dest.to_str().unwrap(), "size": 11}),
            cancel: CancellationToken::new(),
        };
        let handler = tokio::spawn(async move { FileStream.run(ctx).await });

        relay::write_frame(&mut client_stream, &RelayFrame::data(1, &b"hello "[..]))
            .await
            .unwrap();
        relay::write_frame(&mut client_stream, &RelayFrame::data(1, &b"world"[..]))
            .await
            .unwrap();
        relay::write_close(&mut client_stream, 1).await.unwrap();

        // Expect at least one progress tick, then the result, then close.
        let mut saw_tick = false;
        let result = loop {
            let frame = relay::read_frame(&mut client_stream).await.unwrap();
            match frame.opcode {
                Opcode::Data => {
                    let tick: ProgressTick = serde_json::from_slice(&frame.payload).unwrap();
                    assert_eq!(tick.total_bytes, 11);
                    saw_tick = true;
                },
                Opcode::Result => {
                    break serde_json::from_slice::<ResultFrame>(&frame.payload).unwrap();
                },
                Opcode::Close => panic!("close before result"),
            }
        };
        assert!(saw_tick);
        assert!(result.is_ok());
        assert_eq!(result.data["bytes_written"], json!(11));

        handler.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn send_streams_file_bytes_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("download.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let ctx = StreamContext {
            worker: test_context(),
            stream: server_stream,
            stream_id: 1,
            command: "send".into(),
            args: json!({"path": src.to_str().unwrap()}),
            cancel: CancellationToken::new(),
        };
        let handler = tokio::spawn(async move { FileStream.run(ctx).await });

        let mut received = Vec::new();
        loop {
            let frame = relay::read_frame(&mut client_stream).await.unwrap();
            match frame.opcode {
                Opcode::Data => received.extend_from_slice(&frame.payload),
                Opcode::Close => break,
                Opcode::Result => panic!("raw send must not produce a result"),
            }
        }
        assert_eq!(received, payload);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_missing_file_yields_not_found() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let ctx = StreamContext {
            worker: test_context(),
            stream: server_stream,
            stream_id: 1,
            command: "send".into(),
            args: json!({"path": "/nonexistent/definitely-missing"}),
            cancel: CancellationToken::new(),
        };
        let handler = tokio::spawn(async move { FileStream.run(ctx).await });

        let frame = relay::read_frame(&mut client_stream).await.unwrap();
        assert_eq!(frame.opcode, Opcode::Result);
        let result: ResultFrame = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(result.code, 404);
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn unknown_file_command_is_bad_request() {
        let (mut client_stream, server_stream, _c, _s) = stream_pair().await;
        let ctx = StreamContext {
            worker: test_context(),
            stream: server_stream,
            stream_id: 1,
            command: "mangle".into(),
            args: json!({"path": "/tmp/x"}),
            cancel: CancellationToken::new(),
        };
        let handler = tokio::spawn(async move { FileStream.run(ctx).await });

        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            relay::read_frame(&mut client_stream),
        )
        .await
        .unwrap()
        .unwrap();
        let result: ResultFrame = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(result.code, 400);
        assert!(result.status.contains("unknown"));
        assert!(handler.await.unwrap().is_err());
    }
}
