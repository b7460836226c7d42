//! Tool providers the playground can call.
//!
//! A [`McpHost`] owns a set of servers keyed by provider id. Servers are either
//! built in (see [`fetch`]) or child processes speaking JSON-RPC over stdio.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod fetch;
pub mod host;
pub mod jsonrpc;
pub mod server;
mod transport;

pub use host::{McpHost, McpServer};
pub use server::{ServerSpec, StdioServer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub tool: McpTool,
}

/// Payload of a `tools/call` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolResultContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResultContent {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent {
                r#type: "text".into(),
                text: Some(text.into()),
                ..Default::default()
            }],
            is_error: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: Some(true),
            ..Self::text(text)
        }
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Text content joined with newlines; non-text content is skipped.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|c| c.r#type == "text")
            .map(|c| c.text.clone().unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
