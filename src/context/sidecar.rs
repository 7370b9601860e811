//! Sidecar inference runtime
//!
//! Runs the native engine in a separate process and talks to it with JSON-RPC
//! over stdin/stdout, one request per line. The process is started lazily and
//! respawned on the next request if it dies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use super::runtime::{ContextParams, InferenceRuntime, NativeHandle, RuntimeError};

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    params: serde_json::Value,
}

impl JsonRpcRequest {
    fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Sidecar executable
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SidecarConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

struct SidecarProcess {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    request_id: u64,
}

impl SidecarProcess {
    async fn send_request(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RequestError> {
        self.request_id += 1;
        let request = JsonRpcRequest::new(self.request_id, method, params);

        let request_json = serde_json::to_string(&request)
            .map_err(|e| RequestError::Transport(format!("Failed to serialize request: {}", e)))?;

        self.stdin
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| RequestError::Transport(format!("Failed to write to sidecar: {}", e)))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| RequestError::Transport(format!("Failed to write newline: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| RequestError::Transport(format!("Failed to flush: {}", e)))?;

        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| RequestError::Transport(format!("Failed to read from sidecar: {}", e)))?;
        if read == 0 {
            return Err(RequestError::Transport("Sidecar closed its output".to_string()));
        }

        let response: JsonRpcResponse = serde_json::from_str(&line)
            .map_err(|e| RequestError::Transport(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(RequestError::Remote(error.message));
        }

        response
            .result
            .ok_or_else(|| RequestError::Remote("Empty response".to_string()))
    }

    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Why a request failed: the process itself, or the engine inside it
enum RequestError {
    Transport(String),
    Remote(String),
}

pub struct SidecarRuntime {
    config: SidecarConfig,
    process: Mutex<Option<SidecarProcess>>,
}

impl SidecarRuntime {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<SidecarProcess, RuntimeError> {
        log::info!("Starting inference sidecar: {}", self.config.program.display());

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Unavailable(format!("Failed to start sidecar: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RuntimeError::Unavailable("Failed to get sidecar stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Unavailable("Failed to get sidecar stdout".to_string()))?;

        Ok(SidecarProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            request_id: 0,
        })
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RequestError> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn().map_err(|e| RequestError::Transport(e.to_string()))?);
        }
        let process = guard
            .as_mut()
            .ok_or_else(|| RequestError::Transport("Sidecar not running".to_string()))?;

        let result = process.send_request(method, params).await;
        if let Err(RequestError::Transport(message)) = &result {
            log::warn!("Sidecar request {} failed, dropping process: {}", method, message);
            if let Some(mut dead) = guard.take() {
                dead.kill();
            }
        }
        result
    }

    /// Stop the sidecar process
    pub async fn shutdown(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill();
        }
    }
}

#[async_trait]
impl InferenceRuntime for SidecarRuntime {
    async fn load(&self, model_path: &Path, params: ContextParams) -> Result<NativeHandle, RuntimeError> {
        let result = self
            .request(
                "load_model",
                json!({
                    "model_path": model_path.to_string_lossy(),
                    "n_ctx": params.n_context,
                    "n_gpu_layers": if params.use_acceleration { params.n_gpu_layers } else { 0 },
                    "use_gpu": params.use_acceleration,
                }),
            )
            .await
            .map_err(|e| match e {
                RequestError::Transport(m) => RuntimeError::Unavailable(m),
                RequestError::Remote(m) => RuntimeError::LoadFailed(m),
            })?;

        result
            .get("context_id")
            .and_then(|v| v.as_str())
            .map(|id| NativeHandle(id.to_string()))
            .ok_or_else(|| RuntimeError::LoadFailed("Sidecar returned no context id".to_string()))
    }

    async fn release(&self, handle: NativeHandle) -> Result<(), RuntimeError> {
        self.request("release_model", json!({ "context_id": handle.0 }))
            .await
            .map(|_| ())
            .map_err(|e| match e {
                RequestError::Transport(m) | RequestError::Remote(m) => RuntimeError::ReleaseFailed(m),
            })
    }
}
