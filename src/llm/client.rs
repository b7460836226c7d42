use anyhow::{Context, bail};
use futures::StreamExt as _;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::llm::wire::{SseLines, StreamChunk, ToolCallAccumulator, to_wire_messages, to_wire_tools};
use crate::llm::{CompletionRequest, EventStream, FinishReason, StreamEvent};
use crate::tab::TokenUsage;

/// Client for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl LlmClient {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.post(format!("{}{path}", self.api_url));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    pub async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        let mut req = self.http.get(format!("{}/models", self.api_url));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("listing models failed: {status} - {body}");
        }
        let list: ModelList = res.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// Starts a streaming completion. Events arrive on the returned channel;
    /// the channel closes once the response ends.
    pub async fn stream(&self, request: &CompletionRequest) -> anyhow::Result<EventStream> {
        let body = request_body(request);
        debug!("POST {}/chat/completions model={}", self.api_url, request.model);
        let res = self
            .post("/chat/completions")
            .json(&body)
            .send()
            .await
            .context("sending completion request")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            bail!("Request failed: {status} - {body}");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut bytes = res.bytes_stream();
        tokio::spawn(async move {
            let mut sse = SseLines::default();
            let mut calls = ToolCallAccumulator::default();
            let mut usage: Option<TokenUsage> = None;
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(e.into()));
                        return;
                    }
                };
                for data in sse.push(&chunk) {
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(StreamEvent::Finish { usage }));
                        return;
                    }
                    let parsed: StreamChunk = match serde_json::from_str(&data) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("skipping unparseable chunk: {e}");
                            continue;
                        }
                    };
                    if let Some(u) = parsed.usage {
                        usage = Some(u.into());
                    }
                    for event in chunk_events(parsed, &mut calls, usage) {
                        if tx.send(Ok(event)).is_err() {
                            // receiver gone, the run was stopped
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(Ok(StreamEvent::Finish { usage }));
        });
        Ok(rx)
    }
}

fn chunk_events(chunk: StreamChunk, calls: &mut ToolCallAccumulator, usage: Option<TokenUsage>) -> Vec<StreamEvent> {
    let mut events = vec![];
    let Some(choice) = chunk.choices.into_iter().next() else {
        return events;
    };
    if let Some(r) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
        events.push(StreamEvent::ReasoningDelta(r));
    }
    if let Some(t) = choice.delta.content.filter(|t| !t.is_empty()) {
        events.push(StreamEvent::TextDelta(t));
    }
    for tc in choice.delta.tool_calls.unwrap_or_default() {
        calls.push(&tc);
    }
    if let Some(reason) = choice.finish_reason {
        let mut finish_reason = FinishReason::parse(&reason);
        // some servers report "stop" even though they streamed tool calls
        if !calls.is_empty() {
            finish_reason = FinishReason::ToolCalls;
        }
        events.push(StreamEvent::StepFinish {
            finish_reason,
            tool_calls: calls.finish(),
            tool_results: vec![],
            usage,
        });
    }
    events
}

fn request_body(request: &CompletionRequest) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("stream".into(), json!(true));
    body.insert("stream_options".into(), json!({"include_usage": true}));
    body.insert(
        "messages".into(),
        json!(to_wire_messages(&request.system_prompt, &request.messages)),
    );
    if !request.tools.is_empty() {
        body.insert("tools".into(), json!(to_wire_tools(&request.tools)));
    }
    let s = &request.settings;
    if let Some(v) = s.temperature {
        body.insert("temperature".into(), json!(v));
    }
    if let Some(v) = s.max_tokens {
        body.insert("max_tokens".into(), json!(v));
    }
    if let Some(v) = s.top_p {
        body.insert("top_p".into(), json!(v));
    }
    if let Some(v) = s.frequency_penalty {
        body.insert("frequency_penalty".into(), json!(v));
    }
    if let Some(v) = s.presence_penalty {
        body.insert("presence_penalty".into(), json!(v));
    }
    if !s.stop.is_empty() {
        body.insert("stop".into(), json!(s.stop));
    }
    Value::Object(body)
}
