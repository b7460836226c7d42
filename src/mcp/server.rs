use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mcp::McpTool;
use crate::mcp::host::McpServer;
use crate::mcp::jsonrpc::{self, RpcMessage, id_key};
use crate::mcp::transport::{InboundLine, StdioTransport};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// How to launch an external MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Tools that only read and may run without approval.
    #[serde(default)]
    pub read_tools: Vec<String>,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RpcMessage>>>>;

/// An MCP server running as a child process.
pub struct StdioServer {
    pub spec: ServerSpec,
    transport: tokio::sync::Mutex<StdioTransport>,
    pending: Pending,
    tool_cache: Mutex<Vec<McpTool>>,
    req_timeout: Duration,
    _child: Child,
}

impl StdioServer {
    pub async fn spawn(spec: ServerSpec, req_timeout: Duration, startup_timeout: Duration) -> Result<Self> {
        let mut child = Command::new(&spec.cmd)
            .args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", spec.id))?;

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("no stderr"))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;

        let mut transport = StdioTransport::new(stdout, stderr, stdin);
        let lines = transport
            .take_lines()
            .ok_or_else(|| anyhow!("transport lines already taken"))?;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        start_reader(spec.id.clone(), lines, pending.clone());

        let server = Self {
            spec,
            transport: tokio::sync::Mutex::new(transport),
            pending,
            tool_cache: Mutex::new(vec![]),
            req_timeout,
            _child: child,
        };

        timeout(startup_timeout, server.initialize())
            .await
            .context("timeout waiting for initialize")??;

        if let Err(e) = server.refresh_tools().await {
            warn!("could not list tools of {}: {e:?}", server.spec.id);
        }

        Ok(server)
    }

    async fn initialize(&self) -> Result<Value> {
        let res = self
            .rpc_call(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        let note = jsonrpc::notification("notifications/initialized", None);
        self.transport.lock().await.send_json(&note).await?;
        Ok(res)
    }

    pub async fn refresh_tools(&self) -> Result<()> {
        let res = self.rpc_call("tools/list", Value::Null).await?;
        let tools: Vec<McpTool> = match res.get("tools") {
            Some(t) => serde_json::from_value(t.clone())?,
            None => vec![],
        };
        *self.tool_cache.lock() = tools;
        Ok(())
    }

    pub async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let params = if params.is_null() { None } else { Some(params) };
        let req = jsonrpc::req(method, Value::String(id.clone()), params);
        if let Err(e) = self.transport.lock().await.send_json(&req).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let msg = match timeout(self.req_timeout, rx).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(_)) => return Err(anyhow!("rpc {method} channel closed")),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(anyhow!("rpc {method} timed out"));
            }
        };

        match msg {
            RpcMessage::Ok(ok) => Ok(ok.result),
            RpcMessage::Err(e) => Err(anyhow!(
                "rpc error {method}: {} {:?}",
                e.error.message,
                e.error.data
            )),
            _ => Err(anyhow!("unexpected message from server during {method}")),
        }
    }
}

fn start_reader(server_id: String, mut lines: tokio::sync::mpsc::UnboundedReceiver<InboundLine>, pending: Pending) {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            match line {
                InboundLine::Stdout(s) => {
                    let Ok(msg) = serde_json::from_str::<RpcMessage>(&s) else {
                        debug!(server = %server_id, line = %s, "server stdout (non-json)");
                        continue;
                    };
                    // Route responses to whoever is waiting on that id.
                    let Some(key) = msg.id().map(id_key) else {
                        debug!(server = %server_id, "notification from server: {s}");
                        continue;
                    };
                    if let Some(tx) = pending.lock().remove(&key) {
                        let _ = tx.send(msg);
                    }
                }
                InboundLine::Stderr(s) => {
                    warn!(server = %server_id, line = %s, "server stderr");
                }
            }
        }
        // Dropping the senders wakes every remaining caller with a closed channel.
        pending.lock().clear();
    });
}

#[async_trait::async_trait]
impl McpServer for StdioServer {
    async fn list_tools(&self) -> Vec<McpTool> {
        self.tool_cache.lock().clone()
    }

    async fn rpc(&mut self, method: &str, params: Value) -> Result<Value> {
        self.rpc_call(method, params).await
    }

    fn read_only_tools(&self) -> Vec<String> {
        self.spec.read_tools.clone()
    }
}
