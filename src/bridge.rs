//! Process bridge between the gateway and one MCP server subprocess.
//!
//! Each bridge owns exactly one subprocess bound to one account and speaks a
//! line-delimited JSON-RPC dialect over its stdin/stdout. The transport is
//! half-duplex: a single mutex covers the child handles and the request-id
//! counter, so a second call cannot start writing until the first has read
//! its response.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::protocol::{extract_tool_text, parse_tool_list, RpcRequest, RpcResponse, ToolDescriptor};

/// Errors from the subprocess transport and protocol.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No live subprocess behind this bridge (never started, stopped, or
    /// observed dead). The registry self-heals this before the next request.
    #[error("mcp server is not running")]
    NotRunning,

    /// The subprocess closed its stdout without answering.
    #[error("mcp server closed the connection")]
    ClosedPipe,

    /// Pipe-level I/O failure (subprocess exited mid-exchange, spawn failed).
    #[error("mcp transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The response carried an explicit `error` field. Surfaced to the
    /// caller as a tool-execution failure, never retried.
    #[error("mcp protocol error: {0}")]
    Protocol(Value),

    /// The response line was not valid JSON.
    #[error("invalid mcp frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}

/// Session-facing bridge operations. The registry and the streaming
/// pipeline only see this trait, so tests can substitute recording fakes.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Whether the backend subprocess is still running.
    async fn is_alive(&self) -> bool;

    /// Tear down the current subprocess (if any) and start a fresh one
    /// bound to `account_id`, including the `initialize` handshake.
    async fn restart(&self, account_id: &str) -> Result<(), BridgeError>;

    /// `tools/list` exchange.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError>;

    /// `tools/call` exchange; returns the text payload of the tool result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, BridgeError>;

    /// Graceful stop: close stdin, wait a bounded grace period, force-kill
    /// on timeout. Idempotent.
    async fn stop(&self);
}

/// Creates started bridges for the session registry.
#[async_trait]
pub trait BridgeFactory: Send + Sync {
    async fn create(&self, account_id: &str) -> Result<Arc<dyn ToolBridge>, BridgeError>;
}

struct BridgeIo {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl BridgeIo {
    /// Write one request frame and read one response line. Positional
    /// correlation: the caller holds the bridge lock across the pair.
    async fn exchange(&mut self, request: &RpcRequest) -> Result<RpcResponse, BridgeError> {
        let mut frame = serde_json::to_string(request)?;
        frame.push('\n');
        self.stdin.write_all(frame.as_bytes()).await?;
        self.stdin.flush().await?;

        match self.stdout.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(BridgeError::ClosedPipe),
        }
    }
}

/// Bridge to one MCP server subprocess over stdio.
pub struct McpBridge {
    config: BridgeConfig,
    io: Mutex<Option<BridgeIo>>,
}

impl McpBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            io: Mutex::new(None),
        }
    }

    /// Spawn the subprocess with the account injected into its environment
    /// and perform the `initialize` handshake. Any previous subprocess is
    /// stopped first, so this doubles as restart-in-place.
    pub async fn start(&self, account_id: &str) -> Result<(), BridgeError> {
        let mut slot = self.io.lock().await;

        if let Some(old) = slot.take() {
            stop_io(old, self.config.stop_grace()).await;
        }

        info!(account = %account_id, command = %self.config.command, "starting mcp server");

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env(&self.config.account_env, account_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(BridgeError::ClosedPipe)?;
        let stdout = child.stdout.take().ok_or(BridgeError::ClosedPipe)?;

        let mut io = BridgeIo {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };

        io.next_id += 1;
        let response = io.exchange(&RpcRequest::initialize(io.next_id)).await?;
        if let Some(error) = response.error {
            stop_io(io, self.config.stop_grace()).await;
            return Err(BridgeError::Protocol(error));
        }

        info!(account = %account_id, "mcp server initialized");
        *slot = Some(io);
        Ok(())
    }

    /// One request/response pair under the bridge mutex.
    async fn request(&self, method: &str, params: Value) -> Result<RpcResponse, BridgeError> {
        let mut slot = self.io.lock().await;
        let io = slot.as_mut().ok_or(BridgeError::NotRunning)?;

        // A dead subprocess fails the request outright; the registry
        // restarts the bridge before serving the next one.
        if io.child.try_wait()?.is_some() {
            return Err(BridgeError::NotRunning);
        }

        io.next_id += 1;
        let id = io.next_id;
        io.exchange(&RpcRequest::new(id, method, params)).await
    }
}

#[async_trait]
impl ToolBridge for McpBridge {
    async fn is_alive(&self) -> bool {
        let mut slot = self.io.lock().await;
        match slot.as_mut() {
            Some(io) => matches!(io.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn restart(&self, account_id: &str) -> Result<(), BridgeError> {
        self.start(account_id).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let response = self.request("tools/list", serde_json::json!({})).await?;
        if let Some(error) = response.error {
            return Err(BridgeError::Protocol(error));
        }
        Ok(parse_tool_list(response.result.as_ref()))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, BridgeError> {
        let response = self
            .request(
                "tools/call",
                serde_json::json!({"name": name, "arguments": arguments}),
            )
            .await?;
        if let Some(error) = response.error {
            return Err(BridgeError::Protocol(error));
        }
        Ok(extract_tool_text(response.result.as_ref()))
    }

    async fn stop(&self) {
        let mut slot = self.io.lock().await;
        if let Some(io) = slot.take() {
            stop_io(io, self.config.stop_grace()).await;
        }
    }
}

/// Close stdin (the graceful shutdown signal for a stdio server), wait out
/// the grace period, then force-kill.
async fn stop_io(io: BridgeIo, grace: Duration) {
    let BridgeIo {
        mut child, stdin, ..
    } = io;
    drop(stdin);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(exit = %status, "mcp server stopped"),
        Ok(Err(e)) => warn!(error = %e, "failed waiting for mcp server"),
        Err(_) => {
            warn!("mcp server did not exit in time, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill mcp server");
            }
        }
    }
}

/// Production factory: spawns an [`McpBridge`] per session.
pub struct McpBridgeFactory {
    config: BridgeConfig,
}

impl McpBridgeFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BridgeFactory for McpBridgeFactory {
    async fn create(&self, account_id: &str) -> Result<Arc<dyn ToolBridge>, BridgeError> {
        let bridge = McpBridge::new(self.config.clone());
        bridge.start(account_id).await?;
        Ok(Arc::new(bridge))
    }
}
