//! Log tailing over a stream.
//!
//! Spawns the journal reader as a subprocess and relays its stdout as data
//! frames. In follow mode the subprocess never exits on its own, so the
//! peer's close frame is the only thing that ends the stream: the watcher
//! cancels the context, the child is killed, and the handler emits its
//! close frame. A raw byte stream — no structured result.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use lio_core::relay::{self, RelayFrame};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{pump_reader, spawn_close_watcher};
use crate::registry::{HandlerError, StreamContext, StreamHandler};

fn default_follow() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct LogsArgs {
    /// Systemd unit to filter on; the whole journal when absent.
    #[serde(default)]
    unit: Option<String>,
    /// Number of historical lines to include.
    #[serde(default)]
    lines: Option<u32>,
    /// Keep following new entries until the peer closes.
    #[serde(default = "default_follow")]
    follow: bool,
}

/// "logs" stream handler.
pub struct LogsStream {
    program: String,
}

impl LogsStream {
    /// Tail logs through an alternative reader program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command_args(args: &LogsArgs) -> Vec<String> {
        let mut out = vec!["--no-pager".to_string(), "--output=short-iso".to_string()];
        if let Some(unit) = &args.unit {
            out.push("-u".to_string());
            out.push(unit.clone());
        }
        if let Some(lines) = args.lines {
            out.push("-n".to_string());
            out.push(lines.to_string());
        }
        if args.follow {
            out.push("-f".to_string());
        }
        out
    }
}

impl Default for LogsStream {
    fn default() -> Self {
        Self::new("journalctl")
    }
}

#[async_trait]
impl StreamHandler for LogsStream {
    async fn run(&self, ctx: StreamContext) -> Result<(), HandlerError> {
        let StreamContext {
            stream,
            stream_id,
            args,
            cancel,
            ..
        } = ctx;
        let (reader_half, mut writer_half) = tokio::io::split(stream);

        let params: LogsArgs = match serde_json::from_value(args) {
            Ok(params) => params,
            Err(err) => {
                let message = format!("bad logs arguments: {err}");
                let _ = relay::write_result_error(&mut writer_half, stream_id, 400, &message).await;
                return Err(HandlerError::bad_request(message));
            },
        };

        let mut child = match Command::new(&self.program)
            .args(Self::command_args(&params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to spawn {}: {err}", self.program);
                let _ = relay::write_result_error(&mut writer_half, stream_id, 500, &message).await;
                return Err(HandlerError::internal(message));
            },
        };
        debug!(program = %self.program, unit = ?params.unit, follow = params.follow, "log tail started");

        let watcher = spawn_close_watcher(reader_half, cancel.clone(), None);

        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_reader(stdout, out_tx));
        } else {
            drop(out_tx);
        }

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
                            killed = true;
                            let _ = child.start_kill();
                        }
                    },
                    None => break,
                },
            }
        }

        let _ = child.wait().await;
        let _ = relay::write_close(&mut writer_half, stream_id).await;
        watcher.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_args_cover_all_knobs() {
        let args = LogsArgs {
            unit: Some("nginx.service".into()),
            lines: Some(200),
            follow: true,
        };
        let built = LogsStream::command_args(&args);
        assert_eq!(
            built,
            vec!["--no-pager", "--output=short-iso", "-u", "nginx.service", "-n", "200", "-f"]
        );
    }

    #[test]
    fn command_args_minimal_without_follow() {
        let args = LogsArgs {
            unit: None,
            lines: None,
            follow: false,
        };
        assert_eq!(
            LogsStream::command_args(&args),
            vec!["--no-pager", "--output=short-iso"]
        );
    }

    #[test]
    fn args_default_to_follow() {
        let args: LogsArgs = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(args.follow);
        assert!(args.unit.is_none());
    }
}
