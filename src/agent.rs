//! Runs one model turn against a tab and folds the streamed output back into
//! the store.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use futures::future::{AbortHandle, Abortable};
use tracing::{debug, info, warn};

use crate::llm::{CompletionProvider, CompletionRequest, ExecutedToolCall, StreamEvent, ToolCall};
use crate::message::{Message, Role, ToolInvocation, new_message_id};
use crate::store::PlaygroundStore;
use crate::tab::TokenUsage;
use crate::toolset::ToolSet;

pub const APOLOGY: &str = "Sorry, something went wrong while generating a response. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The turn failed and an apology was appended.
    Failed,
    Aborted,
    AlreadyRunning,
    TabMissing,
}

pub struct AgentRunner {
    provider: Arc<dyn CompletionProvider>,
}

/// Clears the tab's run flag and abort handle however the run ends.
struct RunGuard<'a> {
    store: &'a PlaygroundStore,
    tab_id: &'a str,
    run_id: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.store.end_run(self.tab_id, self.run_id);
    }
}

/// The assistant message receiving streamed text for the current step.
#[derive(Default)]
struct Streaming {
    message_id: Option<String>,
    text: String,
}

impl AgentRunner {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    pub async fn run(&self, store: &PlaygroundStore, tab_id: &str) -> RunOutcome {
        let (abort, registration) = AbortHandle::new_pair();
        let run_id = match store.begin_run(tab_id, abort) {
            None => return RunOutcome::TabMissing,
            Some(None) => {
                debug!("tab {tab_id} is already running");
                return RunOutcome::AlreadyRunning;
            }
            Some(Some(id)) => id,
        };
        let _guard = RunGuard { store, tab_id, run_id };

        match Abortable::new(self.turn(store, tab_id), registration).await {
            Ok(Ok(())) => RunOutcome::Completed,
            Ok(Err(e)) => {
                warn!("agent run on tab {tab_id} failed: {e:#}");
                store.apply_to(tab_id, |s| {
                    s.messages.push(Message::assistant(APOLOGY).with_id(new_message_id()));
                });
                RunOutcome::Failed
            }
            Err(_) => {
                info!("agent run on tab {tab_id} stopped");
                RunOutcome::Aborted
            }
        }
    }

    pub fn stop(&self, store: &PlaygroundStore, tab_id: &str) -> bool {
        store.stop(tab_id)
    }

    async fn turn(&self, store: &PlaygroundStore, tab_id: &str) -> anyhow::Result<()> {
        let state = store
            .tab_state(tab_id)
            .ok_or_else(|| anyhow!("tab {tab_id} closed before the run started"))?;
        let tools = ToolSet::build(&store.tool_catalog(), &state.enabled_tools, &state.modified_tools);
        debug!("tab {tab_id}: {} messages, {} tools", state.messages.len(), tools.len());

        let request = CompletionRequest {
            model: state.model,
            credential_id: state.credential_id,
            system_prompt: state.system_prompt,
            messages: state.messages,
            tools: tools.specs().to_vec(),
            settings: state.settings,
            max_steps: state.max_steps,
        };

        let started = Instant::now();
        let mut events = self.provider.stream(request).await?;
        let mut streaming = Streaming::default();
        let mut step_usage: Option<TokenUsage> = None;
        let mut final_usage: Option<TokenUsage> = None;

        while let Some(event) = events.recv().await {
            match event? {
                StreamEvent::TextDelta(delta) => {
                    streaming.text.push_str(&delta);
                    let text = streaming.text.clone();
                    update_streaming(store, tab_id, &mut streaming, |m| m.set_text(text));
                }
                StreamEvent::ReasoningDelta(delta) => {
                    update_streaming(store, tab_id, &mut streaming, |m| m.append_reasoning(&delta));
                }
                StreamEvent::StepFinish {
                    tool_calls,
                    tool_results,
                    usage,
                    ..
                } => {
                    if let Some(u) = usage {
                        *step_usage.get_or_insert_with(TokenUsage::default) += u;
                    }
                    if !tool_calls.is_empty() {
                        let messages = invocation_messages(&tools, tool_calls, &tool_results);
                        store.apply_to(tab_id, |s| s.messages.extend(messages));
                    }
                    // text after a step boundary opens a new message
                    streaming = Streaming::default();
                }
                StreamEvent::Finish { usage } => {
                    final_usage = usage;
                    break;
                }
            }
        }

        let usage = final_usage.or(step_usage);
        let latency_ms = started.elapsed().as_millis() as u64;
        store.apply_to(tab_id, |s| {
            if usage.is_some() {
                s.token_usage = usage;
            }
            s.latency_ms = Some(latency_ms);
        });
        Ok(())
    }
}

/// Applies `f` to the streaming assistant message, creating it on first use.
fn update_streaming(
    store: &PlaygroundStore,
    tab_id: &str,
    streaming: &mut Streaming,
    f: impl FnOnce(&mut Message),
) {
    match &streaming.message_id {
        Some(id) => {
            store.apply_to(tab_id, |s| {
                if let Some(m) = s.messages.iter_mut().find(|m| &m.id == id) {
                    f(m);
                }
            });
        }
        None => {
            let mut message = Message::new(Role::Assistant, vec![]).with_id(new_message_id());
            f(&mut message);
            streaming.message_id = Some(message.id.clone());
            store.apply_to(tab_id, |s| s.messages.push(message));
        }
    }
}

fn invocation_messages(tools: &ToolSet, calls: Vec<ToolCall>, executed: &[ExecutedToolCall]) -> Vec<Message> {
    calls
        .into_iter()
        .map(|call| {
            let mut invocation = ToolInvocation::call(call.id, call.name, call.args);
            invocation.target = tools.resolve(&invocation.tool_name).cloned();
            if invocation.target.is_none() {
                debug!("model called unknown tool {}", invocation.tool_name);
            }
            if let Some(done) = executed.iter().find(|e| e.tool_call_id == invocation.tool_call_id) {
                invocation.resolve(done.result.clone());
            }
            Message::tool_invocation(invocation).with_id(new_message_id())
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::llm::{EventStream, FinishReason};
    use crate::mcp::McpTool;
    use crate::message::{InvocationState, Part};
    use crate::store::StoreConfig;
    use crate::tool_override::ToolKey;
    use crate::toolbox::ToolResult;

    pub(crate) enum Script {
        Events(Vec<anyhow::Result<StreamEvent>>),
        /// `stream` itself fails.
        Refuse(String),
        /// Sends the events, then keeps the stream open.
        Hang(Vec<StreamEvent>),
    }

    /// Provider replaying canned turns. Once the scripts run out every turn
    /// answers "ok".
    #[derive(Default)]
    pub(crate) struct ScriptedProvider {
        scripts: Mutex<VecDeque<Script>>,
        open: Mutex<Vec<mpsc::UnboundedSender<anyhow::Result<StreamEvent>>>>,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub(crate) fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Feeds an event into the `n`th stream left open by a `Hang` script.
        pub(crate) fn push(&self, n: usize, event: StreamEvent) {
            if let Some(tx) = self.open.lock().get(n) {
                let _ = tx.send(Ok(event));
            }
        }
    }

    pub(crate) fn text_turn(text: &str) -> Script {
        Script::Events(vec![
            Ok(StreamEvent::TextDelta(text.into())),
            Ok(StreamEvent::StepFinish {
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
                tool_results: vec![],
                usage: None,
            }),
            Ok(StreamEvent::Finish { usage: None }),
        ])
    }

    pub(crate) fn tool_turn(calls: &[(&str, &str)]) -> Script {
        Script::Events(vec![
            Ok(StreamEvent::StepFinish {
                finish_reason: FinishReason::ToolCalls,
                tool_calls: calls
                    .iter()
                    .map(|(id, name)| ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        args: json!({}),
                    })
                    .collect(),
                tool_results: vec![],
                usage: None,
            }),
            Ok(StreamEvent::Finish { usage: None }),
        ])
    }

    #[async_trait::async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn stream(&self, request: CompletionRequest) -> anyhow::Result<EventStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            let script = self.scripts.lock().pop_front().unwrap_or_else(|| text_turn("ok"));
            let (tx, rx) = mpsc::unbounded_channel();
            match script {
                Script::Events(events) => {
                    for e in events {
                        tx.send(e).unwrap();
                    }
                }
                Script::Refuse(msg) => anyhow::bail!(msg),
                Script::Hang(events) => {
                    for e in events {
                        tx.send(Ok(e)).unwrap();
                    }
                    self.open.lock().push(tx);
                }
            }
            Ok(rx)
        }
    }

    fn setup(scripts: Vec<Script>) -> (Arc<PlaygroundStore>, Arc<ScriptedProvider>, AgentRunner) {
        let store = PlaygroundStore::new(StoreConfig::default());
        let provider = ScriptedProvider::new(scripts);
        let runner = AgentRunner::new(provider.clone());
        (store, provider, runner)
    }

    fn history_len(store: &PlaygroundStore) -> usize {
        store.tab(&store.current_tab_id()).unwrap().history.len()
    }

    #[tokio::test]
    async fn streamed_text_lands_in_one_message() {
        let usage = TokenUsage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        };
        let (store, _, runner) = setup(vec![Script::Events(vec![
            Ok(StreamEvent::ReasoningDelta("hmm".into())),
            Ok(StreamEvent::TextDelta("Hel".into())),
            Ok(StreamEvent::TextDelta("lo".into())),
            Ok(StreamEvent::Finish { usage: Some(usage) }),
        ])]);
        store.add_message(Message::user("hi"));
        let tab = store.current_tab_id();
        let before = history_len(&store);

        assert_eq!(runner.run(&store, &tab).await, RunOutcome::Completed);

        let state = store.current_state();
        assert_eq!(state.messages.len(), 2);
        let reply = &state.messages[1];
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.text(), "Hello");
        assert_eq!(reply.reasoning(), Some("hmm"));
        assert!(!state.running);
        assert_eq!(state.token_usage, Some(usage));
        assert!(state.latency_ms.is_some());
        // streaming is not undoable on its own
        assert_eq!(history_len(&store), before);
    }

    #[tokio::test]
    async fn tool_calls_become_invocation_messages() {
        let executed = ToolResult::ok("already done");
        let (store, provider, runner) = setup(vec![Script::Events(vec![
            Ok(StreamEvent::TextDelta("Let me check".into())),
            Ok(StreamEvent::StepFinish {
                finish_reason: FinishReason::ToolCalls,
                tool_calls: vec![
                    ToolCall {
                        id: "c1".into(),
                        name: "echo--look".into(),
                        args: json!({"q": 1}),
                    },
                    ToolCall {
                        id: "c2".into(),
                        name: "echo--write".into(),
                        args: json!({}),
                    },
                ],
                tool_results: vec![ExecutedToolCall {
                    tool_call_id: "c2".into(),
                    result: executed.clone(),
                }],
                usage: None,
            }),
            Ok(StreamEvent::TextDelta("after".into())),
            Ok(StreamEvent::Finish { usage: None }),
        ])]);
        let tool = |name: &str| McpTool {
            name: name.into(),
            description: None,
            input_schema: json!({"type": "object"}),
        };
        store.set_tool_catalog("echo", vec![tool("look"), tool("write")]);
        store.update_enabled_tools("echo", vec!["look".into(), "write".into()]);
        store.add_message(Message::user("go"));
        let tab = store.current_tab_id();

        runner.run(&store, &tab).await;

        let request = provider.requests.lock()[0].clone();
        let names: Vec<_> = request.tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["echo--look", "echo--write"]);

        let state = store.current_state();
        let texts: Vec<_> = state.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["go", "Let me check", "", "", "after"]);
        let c1 = state.messages[2].tool_invocations().next().unwrap();
        assert_eq!(c1.state, InvocationState::Call);
        assert_eq!(c1.target, Some(ToolKey::new("echo", "look")));
        let c2 = state.messages[3].tool_invocations().next().unwrap();
        assert_eq!(c2.state, InvocationState::Result);
        assert_eq!(c2.result.as_ref(), Some(&executed));
    }

    #[tokio::test]
    async fn failures_append_one_apology() {
        let (store, _, runner) = setup(vec![
            Script::Refuse("connection refused".into()),
            Script::Events(vec![
                Ok(StreamEvent::TextDelta("partial".into())),
                Err(anyhow!("stream reset")),
            ]),
        ]);
        let tab = store.current_tab_id();

        assert_eq!(runner.run(&store, &tab).await, RunOutcome::Failed);
        assert_eq!(runner.run(&store, &tab).await, RunOutcome::Failed);

        let state = store.current_state();
        let texts: Vec<_> = state.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec![APOLOGY, "partial", APOLOGY]);
        assert!(!state.running);
    }

    #[tokio::test]
    async fn second_run_on_running_tab_is_refused() {
        let (store, provider, runner) = setup(vec![]);
        let tab = store.current_tab_id();
        store.apply(|s| s.running = true);
        assert_eq!(runner.run(&store, &tab).await, RunOutcome::AlreadyRunning);
        assert_eq!(provider.calls(), 0);
        assert_eq!(runner.run(&store, "missing").await, RunOutcome::TabMissing);
    }

    #[tokio::test]
    async fn stop_aborts_without_apology() {
        let (store, _, runner) = setup(vec![Script::Hang(vec![StreamEvent::TextDelta("thinking".into())])]);
        let runner = Arc::new(runner);
        let tab = store.current_tab_id();

        let task = tokio::spawn({
            let (store, runner, tab) = (store.clone(), runner.clone(), tab.clone());
            async move { runner.run(&store, &tab).await }
        });
        while store.current_state().messages.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(store.current_state().running);

        assert!(runner.stop(&store, &tab));
        assert_eq!(task.await.unwrap(), RunOutcome::Aborted);

        let state = store.current_state();
        assert!(!state.running);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].text(), "thinking");
        assert!(matches!(state.messages[0].parts[..], [Part::Text { .. }]));
    }

    fn spawn_run(
        store: &Arc<PlaygroundStore>,
        runner: &Arc<AgentRunner>,
        tab: &str,
    ) -> tokio::task::JoinHandle<RunOutcome> {
        let (store, runner, tab) = (store.clone(), runner.clone(), tab.to_string());
        tokio::spawn(async move { runner.run(&store, &tab).await })
    }

    #[tokio::test]
    async fn undo_cancels_the_run_in_flight() {
        let (store, provider, runner) = setup(vec![
            Script::Hang(vec![StreamEvent::TextDelta("first".into())]),
            Script::Hang(vec![]),
        ]);
        let runner = Arc::new(runner);
        let tab = store.current_tab_id();
        store.add_message(Message::user("hi"));

        let first = spawn_run(&store, &runner, &tab);
        while store.current_state().messages.len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.undo().as_deref(), Some(crate::tab::INITIAL_STATE));
        assert!(!store.current_state().running);

        let second = spawn_run(&store, &runner, &tab);
        while provider.calls() < 2 {
            tokio::task::yield_now().await;
        }
        // late output of the cancelled run goes nowhere
        let late = StreamEvent::StepFinish {
            finish_reason: FinishReason::ToolCalls,
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "docs--search".into(),
                args: json!({}),
            }],
            tool_results: vec![],
            usage: None,
        };
        provider.push(0, late);
        assert_eq!(first.await.unwrap(), RunOutcome::Aborted);

        let state = store.current_state();
        assert!(state.messages.is_empty());
        assert!(state.running);

        assert!(runner.stop(&store, &tab));
        assert_eq!(second.await.unwrap(), RunOutcome::Aborted);
        assert!(!store.current_state().running);
    }
}
