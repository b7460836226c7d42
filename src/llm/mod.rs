//! Streaming completions.
//!
//! The agent only sees [`CompletionProvider`]. [`client::LlmClient`] speaks the
//! OpenAI-compatible `/chat/completions` protocol and [`router::ProviderRouter`]
//! picks the client for a tab's credential.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::tab::{ModelSettings, TokenUsage};
use crate::toolbox::ToolResult;
use crate::toolset::ToolSpec;

pub mod client;
pub mod router;
mod wire;

pub use client::LlmClient;
pub use router::ProviderRouter;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub credential_id: Option<String>,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub settings: ModelSettings,
    pub max_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// A tool call the provider already executed on its side.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedToolCall {
    pub tool_call_id: String,
    pub result: ToolResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    StepFinish {
        finish_reason: FinishReason,
        tool_calls: Vec<ToolCall>,
        tool_results: Vec<ExecutedToolCall>,
        usage: Option<TokenUsage>,
    },
    Finish {
        usage: Option<TokenUsage>,
    },
}

pub type EventStream = mpsc::UnboundedReceiver<anyhow::Result<StreamEvent>>;

#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn stream(&self, request: CompletionRequest) -> anyhow::Result<EventStream>;
}
