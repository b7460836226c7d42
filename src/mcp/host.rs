use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::info;

use crate::mcp::fetch::{FETCH_SERVER_ID, FetchMcpServer};
use crate::mcp::server::{ServerSpec, StdioServer};
use crate::mcp::{CallToolResult, McpTool, ToolDescriptor};
use crate::toolset::ToolCatalog;

#[async_trait::async_trait]
pub trait McpServer: Send + Sync {
    async fn list_tools(&self) -> Vec<McpTool>;

    async fn rpc(&mut self, method: &str, params: Value) -> Result<Value>;

    /// Names of tools that only read state. Everything else needs approval.
    fn read_only_tools(&self) -> Vec<String> {
        vec![]
    }
}

pub struct McpHost {
    servers: RwLock<HashMap<String, Box<dyn McpServer>>>,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
}

impl McpHost {
    /// A host with the built-in fetch server registered.
    pub fn new(request_timeout: Duration, startup_timeout: Duration) -> Self {
        let mut servers: HashMap<String, Box<dyn McpServer>> = HashMap::new();
        servers.insert(FETCH_SERVER_ID.into(), Box::new(FetchMcpServer::default()));
        Self::new_with_servers(servers, request_timeout, startup_timeout)
    }

    pub fn new_with_servers(
        servers: HashMap<String, Box<dyn McpServer>>,
        request_timeout: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            servers: RwLock::new(servers),
            request_timeout,
            startup_timeout,
        }
    }

    pub async fn add_server(&self, spec: ServerSpec) -> Result<()> {
        let id = spec.id.clone();
        let server = StdioServer::spawn(spec, self.request_timeout, self.startup_timeout).await?;
        info!("started MCP server {id}");
        self.servers.write().await.insert(id, Box::new(server));
        Ok(())
    }

    pub async fn insert_server(&self, id: impl Into<String>, server: Box<dyn McpServer>) {
        self.servers.write().await.insert(id.into(), server);
    }

    pub async fn remove_server(&self, id: &str) -> bool {
        self.servers.write().await.remove(id).is_some()
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut res = vec![];
        for (id, s) in self.servers.read().await.iter() {
            res.extend(s.list_tools().await.into_iter().map(|t| ToolDescriptor {
                server_id: id.clone(),
                tool: t,
            }));
        }
        res.sort_by(|a, b| (&a.server_id, &a.tool.name).cmp(&(&b.server_id, &b.tool.name)));
        res
    }

    /// Tools grouped by server, plus the read-only tool names of each server.
    pub async fn catalog(&self) -> (ToolCatalog, HashMap<String, Vec<String>>) {
        let mut catalog = ToolCatalog::new();
        let mut read_only = HashMap::new();
        for (id, s) in self.servers.read().await.iter() {
            catalog.insert(id.clone(), s.list_tools().await);
            read_only.insert(id.clone(), s.read_only_tools());
        }
        (catalog, read_only)
    }

    pub async fn tool_call(&self, server_id: &str, tool_name: &str, arguments: Value) -> Result<CallToolResult> {
        let mut servers = self.servers.write().await;
        let s = servers
            .get_mut(server_id)
            .ok_or_else(|| anyhow!("unknown server {server_id}"))?;
        let params = json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = s.rpc("tools/call", params).await?;
        serde_json::from_value(result).map_err(|e| e.into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;

    /// In-process server that echoes its arguments back.
    pub struct EchoServer {
        pub tools: Vec<&'static str>,
        pub read_only: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl McpServer for EchoServer {
        async fn list_tools(&self) -> Vec<McpTool> {
            self.tools
                .iter()
                .map(|t| McpTool {
                    name: t.to_string(),
                    description: None,
                    input_schema: json!({"type": "object"}),
                })
                .collect()
        }

        async fn rpc(&mut self, method: &str, params: Value) -> Result<Value> {
            if method != "tools/call" {
                bail!("unknown method {method}");
            }
            let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            if name == "explode" {
                bail!("boom");
            }
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
            Ok(serde_json::to_value(CallToolResult::text(format!("{name}: {args}")))?)
        }

        fn read_only_tools(&self) -> Vec<String> {
            self.read_only.iter().map(|s| s.to_string()).collect()
        }
    }

    pub fn echo_host() -> McpHost {
        let mut servers: HashMap<String, Box<dyn McpServer>> = HashMap::new();
        servers.insert(
            "echo".into(),
            Box::new(EchoServer {
                tools: vec!["look", "write", "explode"],
                read_only: vec!["look"],
            }),
        );
        McpHost::new_with_servers(servers, Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn tool_call_routes_to_server() {
        let host = echo_host();
        let res = host.tool_call("echo", "look", json!({"a": 1})).await.unwrap();
        assert_eq!(res.joined_text(), r#"look: {"a":1}"#);
        assert!(host.tool_call("nope", "look", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn catalog_groups_tools_by_server() {
        let host = echo_host();
        let (catalog, read_only) = host.catalog().await;
        let names: Vec<_> = catalog["echo"].iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["look", "write", "explode"]);
        assert_eq!(read_only["echo"], vec!["look".to_string()]);
        assert_eq!(host.list_tools().await.len(), 3);
    }
}
