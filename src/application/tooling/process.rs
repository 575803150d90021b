use super::error::ToolingError;
use crate::config::ServerConfig;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// One transient JSON-RPC session to one spawned tool-server process.
///
/// A session serves exactly one discovery or invocation and is then torn
/// down; there is never more than one request in flight, so responses are
/// read inline instead of through a pending-request map. The child is
/// spawned with `kill_on_drop`, so an abandoned session still reclaims the
/// process.
pub(super) struct StdioSession {
    server: String,
    child: Child,
    writer: BufWriter<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioSession {
    pub(super) async fn connect(
        config: &ServerConfig,
        handshake: Duration,
    ) -> Result<Self, ToolingError> {
        let mut command = Command::new(&config.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.workdir {
            command.current_dir(dir);
        }
        if !config.args.is_empty() {
            command.args(&config.args);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ToolingError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| transport(&config.name, "failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport(&config.name, "failed to capture server stdout"))?;

        let mut session = Self {
            server: config.name.clone(),
            child,
            writer: BufWriter::new(stdin),
            lines: BufReader::new(stdout).lines(),
            next_id: 1,
        };

        match session.initialize(handshake).await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.shutdown().await;
                Err(err)
            }
        }
    }

    async fn initialize(&mut self, handshake: Duration) -> Result<(), ToolingError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.request("initialize", params, handshake).await?;
        self.notify("notifications/initialized", json!({})).await
    }

    pub(super) async fn request(
        &mut self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, ToolingError> {
        let id = self.next_id;
        self.next_id += 1;

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        self.write(&payload).await?;

        match timeout(limit, self.read_response(id)).await {
            Ok(result) => result,
            Err(_) => Err(ToolingError::Timeout {
                server: self.server.clone(),
                phase: format!("'{method}' response"),
            }),
        }
    }

    async fn read_response(&mut self, id: u64) -> Result<Value, ToolingError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|source| transport(&self.server, source.to_string()))?
                .ok_or_else(|| ToolingError::Terminated {
                    server: self.server.clone(),
                })?;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('\u{1b}') {
                debug!(
                    server = %self.server,
                    line = trimmed,
                    "skipping non-JSON ANSI log line from tool server"
                );
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(source) => {
                    warn!(
                        server = %self.server,
                        line = trimmed,
                        %source,
                        "received invalid JSON from tool server"
                    );
                    continue;
                }
            };

            if value.get("method").is_some() {
                match value.get("id").cloned() {
                    Some(request_id) => self.answer_server_request(request_id, &value).await?,
                    None => debug!(
                        server = %self.server,
                        method = value.get("method").and_then(serde_json::Value::as_str).unwrap_or_default(),
                        "ignoring notification from tool server"
                    ),
                }
                continue;
            }

            if value.get("id").and_then(Value::as_u64) != Some(id) {
                debug!(server = %self.server, "received response for unknown request");
                continue;
            }

            if let Some(error) = value.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(ToolingError::Rpc {
                    server: self.server.clone(),
                    code,
                    message,
                });
            }

            return Ok(value.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn answer_server_request(
        &mut self,
        id: Value,
        request: &Value,
    ) -> Result<(), ToolingError> {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match method {
            "ping" => {
                self.write(&json!({ "jsonrpc": "2.0", "id": id, "result": {} }))
                    .await
            }
            other => {
                warn!(server = %self.server, method = other, "server sent unsupported request");
                self.write(&json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("client does not implement method '{other}'"),
                    }
                }))
                .await
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), ToolingError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write(&payload).await
    }

    async fn write(&mut self, message: &Value) -> Result<(), ToolingError> {
        let encoded =
            serde_json::to_string(message).map_err(|source| transport(&self.server, source.to_string()))?;
        self.writer
            .write_all(encoded.as_bytes())
            .await
            .map_err(|source| transport(&self.server, source.to_string()))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|source| transport(&self.server, source.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|source| transport(&self.server, source.to_string()))
    }

    pub(super) async fn shutdown(mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(
                server = %self.server,
                %err,
                "failed to kill tool server process (may have already exited)"
            );
        }
        let _ = self.child.wait().await;
    }
}

fn transport(server: &str, message: impl Into<String>) -> ToolingError {
    ToolingError::Transport {
        server: server.to_string(),
        message: message.into(),
    }
}
