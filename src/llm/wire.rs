//! OpenAI-compatible chat completion wire types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ToolCall;
use crate::message::{Message, Part, Role};
use crate::tab::TokenUsage;
use crate::toolset::ToolSpec;

// --- request side ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum WireMessage {
    System {
        content: String,
    },
    User {
        content: Vec<ContentPart>,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    pub r#type: String,
    pub function: Function,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

pub fn to_wire_tools(tools: &[ToolSpec]) -> Vec<Tool> {
    tools
        .iter()
        .map(|t| Tool {
            r#type: "function".into(),
            function: Function {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

/// Flattens the conversation into chat messages.
///
/// Resolved tool invocations become an assistant `tool_calls` message followed
/// by the tool's answer. Unresolved invocations and `data` messages are not
/// sent.
pub fn to_wire_messages(system_prompt: &str, messages: &[Message]) -> Vec<WireMessage> {
    let mut out = vec![];
    if !system_prompt.trim().is_empty() {
        out.push(WireMessage::System {
            content: system_prompt.to_string(),
        });
    }
    for m in messages {
        match m.role {
            Role::Data => continue,
            Role::System => out.push(WireMessage::System { content: m.text() }),
            Role::User => {
                let mut content: Vec<ContentPart> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(ContentPart::Text { text: text.clone() }),
                        _ => None,
                    })
                    .collect();
                content.extend(m.attachments.iter().map(|a| ContentPart::ImageUrl {
                    image_url: ImageUrl { url: a.url.clone() },
                }));
                out.push(WireMessage::User { content });
            }
            Role::Assistant => {
                let text = m.text();
                if !text.is_empty() {
                    out.push(WireMessage::Assistant {
                        content: Some(text),
                        tool_calls: None,
                    });
                }
                for inv in m.tool_invocations() {
                    let Some(result) = &inv.result else { continue };
                    out.push(WireMessage::Assistant {
                        content: None,
                        tool_calls: Some(vec![WireToolCall {
                            id: inv.tool_call_id.clone(),
                            kind: "function".into(),
                            function: WireFunctionCall {
                                name: inv.tool_name.clone(),
                                arguments: inv.args.to_string(),
                            },
                        }]),
                    });
                    out.push(WireMessage::Tool {
                        tool_call_id: inv.tool_call_id.clone(),
                        content: serde_json::to_string(result).unwrap_or_else(|_| result.message.clone()),
                    });
                }
            }
        }
    }
    out
}

// --- streaming response side ---

#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>, // streamed in pieces
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Joins streamed tool call fragments back into whole calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: &ToolCallDelta) {
        // Providers without `index` send one fragment per call or start a new
        // call by sending an id.
        let index = match delta.index {
            Some(i) => i,
            None => {
                let last = self.calls.keys().next_back().copied();
                match (last, &delta.id) {
                    (Some(last), None) => last,
                    (Some(last), Some(_)) => last + 1,
                    (None, _) => 0,
                }
            }
        };
        let entry = self.calls.entry(index).or_default();
        if let Some(id) = &delta.id {
            entry.id = Some(id.clone());
        }
        if let Some(f) = &delta.function {
            if let Some(name) = &f.name {
                entry.name.push_str(name);
            }
            if let Some(args) = &f.arguments {
                entry.arguments.push_str(args);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, c)| {
                let args = if c.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or(Value::String(c.arguments))
                };
                ToolCall {
                    id: c.id.unwrap_or_else(|| format!("call_{index}")),
                    name: c.name,
                    args,
                }
            })
            .collect()
    }
}

/// Splits a byte stream into SSE `data:` payloads, buffering partial lines.
#[derive(Debug, Default)]
pub struct SseLines {
    buf: String,
}

impl SseLines {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = vec![];
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolInvocation;
    use crate::toolbox::ToolResult;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn resolved_invocations_become_call_and_answer() {
        let mut inv = ToolInvocation::call("c1", "fetch--fetch", json!({"url": "u"}));
        let pending = Message::tool_invocation(ToolInvocation::call("c2", "x--y", json!({})));
        inv.resolve(ToolResult::ok("page"));
        let messages = vec![
            Message::user("read u"),
            Message::tool_invocation(inv),
            pending,
            Message::new(Role::Data, vec![]),
            Message::assistant("done"),
        ];
        let wire = serde_json::to_value(to_wire_messages("be nice", &messages)).unwrap();
        assert_eq!(
            wire,
            json!([
                {"role": "system", "content": "be nice"},
                {"role": "user", "content": [{"type": "text", "text": "read u"}]},
                {"role": "assistant", "tool_calls": [{
                    "id": "c1", "type": "function",
                    "function": {"name": "fetch--fetch", "arguments": "{\"url\":\"u\"}"}
                }]},
                {"role": "tool", "tool_call_id": "c1", "content": "{\"success\":true,\"message\":\"page\"}"},
                {"role": "assistant", "content": "done"}
            ])
        );
    }

    #[test]
    fn fragments_accumulate_by_index() {
        let deltas: Vec<ToolCallDelta> = serde_json::from_value(json!([
            {"index": 0, "id": "a", "function": {"name": "fetch--", "arguments": ""}},
            {"index": 1, "id": "b", "function": {"name": "echo--look"}},
            {"index": 0, "function": {"name": "fetch", "arguments": "{\"url\":"}},
            {"index": 0, "function": {"arguments": "\"x\"}"}}
        ]))
        .unwrap();
        let mut acc = ToolCallAccumulator::default();
        for d in &deltas {
            acc.push(d);
        }
        let calls = acc.finish();
        assert_eq!(
            calls,
            vec![
                ToolCall {
                    id: "a".into(),
                    name: "fetch--fetch".into(),
                    args: json!({"url": "x"})
                },
                ToolCall {
                    id: "b".into(),
                    name: "echo--look".into(),
                    args: json!({})
                },
            ]
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn sse_lines_survive_chunk_boundaries() {
        let mut sse = SseLines::default();
        assert!(sse.push(b"data: {\"a\"").is_empty());
        assert_eq!(sse.push(b":1}\r\n\r\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
        assert!(sse.push(b": keep-alive\n").is_empty());
    }
}
