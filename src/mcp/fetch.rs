use std::collections::HashMap;

use anyhow::{anyhow, bail};
use html2md::{TagHandler, TagHandlerFactory, parse_html_custom};
use serde_json::{Value, json};

use crate::mcp::{CallToolResult, McpTool, host::McpServer};

pub const FETCH_SERVER_ID: &str = "fetch";

const FETCH: &str = "fetch";
const FETCH_RAW_HTML: &str = "fetch_raw_html";

/// Built-in server for reading web pages.
///
/// Always registered so a fresh install has at least one tool to play with.
/// Both tools only read, so they run without approval.
#[derive(Default)]
pub struct FetchMcpServer {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl McpServer for FetchMcpServer {
    async fn list_tools(&self) -> Vec<McpTool> {
        let schema = json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                }
            },
            "required": ["url"]
        });
        vec![
            McpTool {
                name: FETCH_RAW_HTML.into(),
                description: Some("Fetch the contents of a URL as raw HTML.".into()),
                input_schema: schema.clone(),
            },
            McpTool {
                name: FETCH.into(),
                description: Some("Fetch the contents of a URL as markdown.".into()),
                input_schema: schema,
            },
        ]
    }

    async fn rpc(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        if method != "tools/call" {
            bail!("unknown RPC method {method}");
        }

        let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name != FETCH && name != FETCH_RAW_HTML {
            bail!("Unknown tool: {name}")
        };

        let Some(url) = params
            .get("arguments")
            .and_then(|a| a.get("url"))
            .and_then(|u| u.as_str())
        else {
            return Ok(serde_json::to_value(CallToolResult::error("missing required argument: url"))?);
        };

        let result = match self.fetch(url).await {
            Ok(html) if name == FETCH => CallToolResult::text(html_to_markdown(&html)),
            Ok(html) => CallToolResult::text(html),
            Err(e) => CallToolResult::error(format!("Fetch error: {e:?}")),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn read_only_tools(&self) -> Vec<String> {
        vec![FETCH.into(), FETCH_RAW_HTML.into()]
    }
}

impl FetchMcpServer {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let res = self.client.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            bail!("{url} returned {status}");
        }
        res.text().await.map_err(|e| anyhow!("{e:?}"))
    }
}

/// Converts a page to markdown, dropping scripts, styles, links and images.
pub fn html_to_markdown(html: &str) -> String {
    let mut handlers: HashMap<String, Box<dyn TagHandlerFactory>> = HashMap::new();
    for tag in ["style", "script", "link", "a", "img", "noscript"] {
        handlers.insert(tag.to_string(), Box::new(SkipFactory));
    }
    parse_html_custom(html, &handlers)
}

struct SkipFactory;
impl TagHandlerFactory for SkipFactory {
    fn instantiate(&self) -> Box<dyn TagHandler> {
        Box::new(Skip)
    }
}

struct Skip;
impl TagHandler for Skip {
    fn handle(&mut self, _tag: &html2md::Handle, _printer: &mut html2md::StructuredPrinter) {}

    fn after_handle(&mut self, _printer: &mut html2md::StructuredPrinter) {}

    fn skip_descendants(&self) -> bool {
        true
    }
}
