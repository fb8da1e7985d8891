//! JSON-RPC 2.0 client for out-of-process providers.
//!
//! A provider is a child process speaking newline-delimited JSON-RPC over its
//! stdio. This client owns the child's pipes exclusively: one mutex guards
//! the write-request/read-response pair, so concurrent calls are allowed but
//! serialized on the wire, and responses are correlated by id. The child's
//! stderr is drained in the background and its tail is attached to provider
//! errors for diagnosis.

use crate::provider::error::{self, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// MCP protocol version sent in the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// How long `close` waits for a provider to exit before killing it.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

const STDERR_TAIL_LINES: usize = 40;

/// The uniform result of every provider tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(default)]
    pub resource: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// What a provider declared via `provider_capabilities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub provider_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub resources: Vec<ResourceCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapability {
    pub kind: String,
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// MCP content framing of a `tools/call` response.
#[derive(Debug, Deserialize)]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ToolContent {
    #[serde(default, rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug)]
struct Wire {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A live connection to one provider process.
#[derive(Debug)]
pub struct ProtocolClient {
    name: String,
    wire: Mutex<Option<Wire>>,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
}

impl ProtocolClient {
    /// Spawns the provider process and performs the initialize handshake.
    pub async fn spawn(name: &str, command: &[String]) -> Result<Self> {
        ensure!(!command.is_empty(), error::EmptyEngineSnafu);
        debug!("Spawning provider '{}': {:?}", name, command);

        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(error::SpawnSnafu {
                provider: name,
                program: &command[0],
            })?;

        let stdin = child.stdin.take().context(error::MissingPipeSnafu {
            provider: name,
            pipe: "stdin",
        })?;
        let stdout = child.stdout.take().context(error::MissingPipeSnafu {
            provider: name,
            pipe: "stdout",
        })?;
        let stderr = child.stderr.take().context(error::MissingPipeSnafu {
            provider: name,
            pipe: "stderr",
        })?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::new()));
        spawn_stderr_reader(name.to_string(), stderr, Arc::clone(&stderr_tail));

        let client = Self {
            name: name.to_string(),
            wire: Mutex::new(Some(Wire {
                stdin,
                stdout: BufReader::new(stdout),
            })),
            child: Mutex::new(Some(child)),
            next_id: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            stderr_tail,
        };

        if let Err(e) = client.handshake().await {
            let _ = client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last lines the provider wrote to stderr, for error reports.
    pub fn stderr_tail(&self) -> String {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }

    async fn handshake(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "testenv-vm",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });
        self.request("initialize", params).await?;
        self.notify("notifications/initialized", json!({})).await?;
        self.initialized.store(true, Ordering::SeqCst);
        debug!("Provider '{}' initialized", self.name);
        Ok(())
    }

    /// Invokes a tool and decodes the result into an [`OperationResult`].
    pub async fn call(&self, tool: &str, input: serde_json::Value) -> Result<OperationResult> {
        ensure!(
            self.initialized.load(Ordering::SeqCst),
            error::NotInitializedSnafu {
                provider: &self.name,
            }
        );
        let params = json!({ "name": tool, "arguments": input });
        let result = self.request("tools/call", params).await?;
        let tool_result: ToolCallResult =
            serde_json::from_value(result).context(error::DecodeSnafu {
                provider: &self.name,
                what: format!("'{}' result", tool),
            })?;

        let text = tool_result
            .content
            .first()
            .map(|content| content.text.clone())
            .unwrap_or_default();

        if tool_result.is_error {
            return Ok(OperationResult {
                success: false,
                resource: serde_json::Value::Null,
                error: Some(OperationError {
                    message: text,
                    retryable: false,
                }),
            });
        }
        Ok(parse_operation_text(&text))
    }

    /// Like [`call`](Self::call), racing completion against cancellation.
    ///
    /// The call keeps running in a worker task until it is aborted, at which
    /// point the wire may hold a half-consumed exchange; callers are expected
    /// to `close` after cancelling.
    pub async fn call_with_cancel(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        tool: &str,
        input: serde_json::Value,
    ) -> Result<OperationResult> {
        let client = Arc::clone(self);
        let tool_owned = tool.to_string();
        let mut task = tokio::spawn(async move { client.call(&tool_owned, input).await });
        tokio::select! {
            _ = cancel.cancelled() => {
                task.abort();
                error::CancelledSnafu {
                    provider: &self.name,
                    tool,
                }
                .fail()
            }
            result = &mut task => result.context(error::JoinSnafu {
                provider: &self.name,
            })?,
        }
    }

    /// Fetches the provider's declared capabilities.
    pub async fn capabilities(&self) -> Result<ProviderCapabilities> {
        let result = self.call("provider_capabilities", json!({})).await?;
        ensure!(
            result.success,
            error::ToolFailedSnafu {
                provider: &self.name,
                tool: "provider_capabilities",
                message: result
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unspecified failure".to_string()),
            }
        );
        let capabilities = match &result.resource {
            serde_json::Value::String(text) => serde_json::from_str(text),
            other => serde_json::from_value(other.clone()),
        }
        .context(error::DecodeSnafu {
            provider: &self.name,
            what: "capabilities",
        })?;
        Ok(capabilities)
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        })
        .context(error::EncodeSnafu {
            provider: &self.name,
        })?;

        // One mutex across the write/read pair: the protocol never
        // interleaves requests, so the next line on stdout answers this frame.
        let mut guard = self.wire.lock().await;
        let wire = guard.as_mut().context(error::ClosedSnafu {
            provider: &self.name,
        })?;
        write_frame(&self.name, &mut wire.stdin, &frame).await?;

        let mut line = String::new();
        let read = wire
            .stdout
            .read_line(&mut line)
            .await
            .context(error::ReadSnafu {
                provider: &self.name,
            })?;
        drop(guard);
        ensure!(
            read > 0,
            error::EofSnafu {
                provider: &self.name,
            }
        );

        let line = line.trim_end();
        let response: JsonRpcResponse =
            serde_json::from_str(line).context(error::ParseSnafu {
                provider: &self.name,
                frame: line,
            })?;
        if let Some(body) = response.error {
            return error::JsonRpcSnafu {
                provider: &self.name,
                code: body.code,
                message: body.message,
            }
            .fail();
        }
        let got = response.id.as_ref().and_then(serde_json::Value::as_u64);
        ensure!(
            got == Some(id),
            error::IdMismatchSnafu {
                provider: &self.name,
                expected: id,
                got: response
                    .id
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string()),
            }
        );
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        })
        .context(error::EncodeSnafu {
            provider: &self.name,
        })?;
        let mut guard = self.wire.lock().await;
        let wire = guard.as_mut().context(error::ClosedSnafu {
            provider: &self.name,
        })?;
        write_frame(&self.name, &mut wire.stdin, &frame).await
    }

    /// Closes the provider: drop stdin, wait briefly, then kill. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut wire = self.wire.lock().await;
            wire.take();
        }
        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            match tokio::time::timeout(CLOSE_WAIT, child.wait()).await {
                Ok(status) => {
                    let status = status.context(error::WaitSnafu {
                        provider: &self.name,
                    })?;
                    debug!("Provider '{}' exited with {}", self.name, status);
                }
                Err(_elapsed) => {
                    warn!(
                        "Provider '{}' did not exit within {:?}; killing it",
                        self.name, CLOSE_WAIT
                    );
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        Ok(())
    }
}

/// Parses a tool's text payload as a typed `OperationResult`, falling back to
/// treating the text as an opaque success payload.
fn parse_operation_text(text: &str) -> OperationResult {
    match serde_json::from_str::<OperationResult>(text) {
        Ok(result) => result,
        Err(_) => OperationResult {
            success: true,
            resource: serde_json::Value::String(text.to_string()),
            error: None,
        },
    }
}

async fn write_frame(name: &str, stdin: &mut ChildStdin, frame: &str) -> Result<()> {
    stdin
        .write_all(frame.as_bytes())
        .await
        .context(error::WriteSnafu { provider: name })?;
    stdin
        .write_all(b"\n")
        .await
        .context(error::WriteSnafu { provider: name })?;
    stdin
        .flush()
        .await
        .context(error::WriteSnafu { provider: name })?;
    Ok(())
}

fn spawn_stderr_reader(
    name: String,
    stderr: ChildStderr,
    tail: Arc<StdMutex<VecDeque<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("provider '{}' stderr: {}", name, line);
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn typed_operation_results_parse() {
        let result =
            parse_operation_text(r#"{"success":true,"resource":{"ip":"192.0.2.5"}}"#);
        assert!(result.success);
        assert_eq!(result.resource["ip"], "192.0.2.5");

        let result = parse_operation_text(
            r#"{"success":false,"error":{"message":"no capacity","retryable":true}}"#,
        );
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.message, "no capacity");
        assert!(error.retryable);
    }

    #[test]
    fn untyped_text_becomes_an_opaque_success() {
        let result = parse_operation_text("pool default already active");
        assert!(result.success);
        assert_eq!(
            result.resource,
            serde_json::Value::String("pool default already active".to_string())
        );
        assert!(result.error.is_none());
    }

    /// Writes a shell script that plays the provider side of the protocol:
    /// answers `initialize` (id 1), swallows the initialized notification,
    /// then answers one `tools/call` (id 2).
    fn scripted_provider(dir: &std::path::Path, call_response_line: &str) -> std::path::PathBuf {
        let path = dir.join("provider.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "read _initialize").unwrap();
        writeln!(
            f,
            r#"printf '%s\n' '{{"jsonrpc":"2.0","id":1,"result":{{"protocolVersion":"2024-11-05"}}}}'"#
        )
        .unwrap();
        writeln!(f, "read _initialized").unwrap();
        writeln!(f, "read _call").unwrap();
        writeln!(f, "printf '%s\\n' '{}'", call_response_line).unwrap();
        // Close stdout but keep draining stdin, so a subsequent call can
        // still write its frame and observes EOF on the read.
        writeln!(f, "exec >&-").unwrap();
        writeln!(f, "cat > /dev/null").unwrap();
        drop(f);
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path
    }

    #[tokio::test]
    async fn handshake_and_call_against_a_scripted_provider() {
        let dir = tempfile::tempdir().unwrap();
        let script = scripted_provider(
            dir.path(),
            r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"{\"success\":true,\"resource\":{\"ip\":\"192.0.2.5\"}}"}],"isError":false}}"#,
        );
        let client =
            ProtocolClient::spawn("scripted", &[script.display().to_string()])
                .await
                .unwrap();

        let result = client
            .call("vm_create", json!({"name": "test-vm"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.resource["ip"], "192.0.2.5");

        // The script exits after one call; the stream closing surfaces as EOF.
        let err = client.call("vm_create", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("EOF"));

        client.close().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_response_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "read _initialize").unwrap();
        writeln!(
            f,
            r#"printf '%s\n' '{{"jsonrpc":"2.0","id":99,"result":{{}}}}'"#
        )
        .unwrap();
        drop(f);
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();

        let err = ProtocolClient::spawn("bad-id", &[path.display().to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("id mismatch"));
    }

    #[tokio::test]
    async fn spawn_failure_names_the_program() {
        let err = ProtocolClient::spawn(
            "ghost",
            &["/nonexistent/provider-binary".to_string(), "--mcp".to_string()],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/provider-binary"));
    }

    #[tokio::test]
    async fn cancellation_races_the_call() {
        let dir = tempfile::tempdir().unwrap();
        // A provider that answers the handshake and then hangs.
        let path = dir.path().join("provider.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "read _initialize").unwrap();
        writeln!(
            f,
            r#"printf '%s\n' '{{"jsonrpc":"2.0","id":1,"result":{{}}}}'"#
        )
        .unwrap();
        writeln!(f, "read _initialized").unwrap();
        writeln!(f, "sleep 60").unwrap();
        drop(f);
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();

        let client = Arc::new(
            ProtocolClient::spawn("hung", &[path.display().to_string()])
                .await
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let pending = client.call_with_cancel(&cancel, "vm_create", json!({}));
        cancel.cancel();
        let err = pending.await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        client.close().await.unwrap();
    }
}
