//! Executing tool invocations.
//!
//! [`AgentToolBox`] is what the approval flow talks to. [`McpToolBox`] is the
//! implementation backed by an [`McpHost`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::mcp::McpHost;
use crate::message::ToolInvocation;
use crate::tool_override::ToolKey;
use crate::toolset::{ToolCatalog, split_qualified_name};

pub const DENIED_MESSAGE: &str = "Tool execution was denied by the user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            token_count: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }

    pub fn denied() -> Self {
        Self::failure(DENIED_MESSAGE)
    }

    pub fn unrecognized(tool_name: &str) -> Self {
        Self::failure(format!("Unrecognized tool: {tool_name}"))
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolClassification {
    pub kind: ToolKind,
    pub running_text: String,
    pub done_text: String,
    pub error_text: String,
}

impl ToolClassification {
    pub fn read(label: &str) -> Self {
        Self::with_kind(ToolKind::Read, label)
    }

    pub fn write(label: &str) -> Self {
        Self::with_kind(ToolKind::Write, label)
    }

    fn with_kind(kind: ToolKind, label: &str) -> Self {
        Self {
            kind,
            running_text: format!("Running {label}..."),
            done_text: format!("Ran {label}"),
            error_text: format!("Failed to run {label}"),
        }
    }
}

#[async_trait::async_trait]
pub trait AgentToolBox: Send + Sync {
    /// `None` means the tool is unknown and must not run.
    fn classification(&self, invocation: &ToolInvocation) -> Option<ToolClassification>;

    async fn execute_read(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolResult>;

    async fn execute_write(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolResult>;
}

/// Tool box routing invocations to MCP servers.
///
/// Tools listed by a server are known; the server's read-only tools are
/// classified [`ToolKind::Read`] and the rest [`ToolKind::Write`] unless
/// [`McpToolBox::classify`] says otherwise.
pub struct McpToolBox {
    host: Arc<McpHost>,
    known: RwLock<HashSet<ToolKey>>,
    classifications: RwLock<HashMap<ToolKey, ToolClassification>>,
}

impl McpToolBox {
    pub fn new(host: Arc<McpHost>) -> Self {
        Self {
            host,
            known: RwLock::new(HashSet::new()),
            classifications: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<McpHost> {
        &self.host
    }

    /// Re-reads the host's tools. Returns the catalog for the store.
    pub async fn refresh(&self) -> ToolCatalog {
        let (catalog, read_only) = self.host.catalog().await;
        let mut known = HashSet::new();
        let mut classes = self.classifications.write();
        for (server_id, tools) in catalog.iter() {
            let reads = read_only.get(server_id).cloned().unwrap_or_default();
            for tool in tools {
                let key = ToolKey::new(server_id.clone(), tool.name.clone());
                if reads.contains(&tool.name) {
                    classes
                        .entry(key.clone())
                        .or_insert_with(|| ToolClassification::read(&tool.name));
                }
                known.insert(key);
            }
        }
        drop(classes);
        *self.known.write() = known;
        catalog
    }

    pub fn classify(&self, key: ToolKey, classification: ToolClassification) {
        self.classifications.write().insert(key, classification);
    }

    fn key_for(invocation: &ToolInvocation) -> Option<ToolKey> {
        invocation
            .target
            .clone()
            .or_else(|| split_qualified_name(&invocation.tool_name))
    }

    async fn call(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolResult> {
        let key = Self::key_for(invocation).ok_or_else(|| anyhow!("cannot route tool {}", invocation.tool_name))?;
        let args = if invocation.args.is_null() {
            Value::Object(Default::default())
        } else {
            invocation.args.clone()
        };
        let res = self.host.tool_call(&key.provider_id, &key.tool_name, args).await?;
        let text = res.joined_text();
        let data = serde_json::to_value(&res.content)?;
        if res.is_error() {
            warn!("tool {}/{} reported an error", key.provider_id, key.tool_name);
            return Ok(ToolResult::failure(text).with_data(data));
        }
        Ok(ToolResult::ok(text).with_data(data))
    }
}

#[async_trait::async_trait]
impl AgentToolBox for McpToolBox {
    fn classification(&self, invocation: &ToolInvocation) -> Option<ToolClassification> {
        let key = Self::key_for(invocation)?;
        if let Some(c) = self.classifications.read().get(&key) {
            return Some(c.clone());
        }
        if self.known.read().contains(&key) {
            return Some(ToolClassification::write(&key.tool_name));
        }
        None
    }

    async fn execute_read(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolResult> {
        self.call(invocation).await
    }

    async fn execute_write(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolResult> {
        info!("executing write tool {} ({})", invocation.tool_name, invocation.tool_call_id);
        self.call(invocation).await
    }
}
