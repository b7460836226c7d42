//! Wires the store, the agent runner and tool approvals together.
//!
//! A conversation advances in drives: the model is run, whatever tool calls
//! can be resolved without the user are resolved, and the model runs again
//! while nothing is left pending. A drive stops when the model answers
//! without tool calls, when a write tool needs approval, or after
//! `max_steps` model calls. Approving the last pending call starts the next
//! drive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentRunner, RunOutcome};
use crate::approval::ToolApprovals;
use crate::app_settings::PlaygroundConfig;
use crate::dataset::{DatasetClient, DatasetItem, Envelope};
use crate::llm::CompletionProvider;
use crate::message::{Message, has_pending_invocations};
use crate::storage::Storage;
use crate::store::{PlaygroundStore, Resolution};
use crate::tab::TabId;
use crate::toolbox::{AgentToolBox, ToolResult};

pub struct Playground {
    store: Arc<PlaygroundStore>,
    runner: AgentRunner,
    approvals: ToolApprovals,
    /// Tabs whose pending calls settled while a model call was in flight.
    /// The drive owning that call continues them.
    deferred: Mutex<HashSet<TabId>>,
}

impl Playground {
    pub fn new(
        store: Arc<PlaygroundStore>,
        provider: Arc<dyn CompletionProvider>,
        toolbox: Arc<dyn AgentToolBox>,
        config: &PlaygroundConfig,
    ) -> Self {
        Self {
            store,
            runner: AgentRunner::new(provider),
            approvals: ToolApprovals::new(toolbox, Duration::from_millis(config.auto_approve_delay_ms)),
            deferred: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<PlaygroundStore> {
        &self.store
    }

    /// Adds a user message to the current tab and drives the conversation.
    /// Refused while the tab is running.
    pub async fn send(&self, text: impl Into<String>) -> RunOutcome {
        let tab = self.store.current_tab_id();
        if !self.store.add_message_when_idle(&tab, Message::user(text)) {
            debug!("tab {tab} is running, message not sent");
            return RunOutcome::AlreadyRunning;
        }
        self.drive(&tab).await
    }

    /// Runs the model on `tab_id` until it stops asking for tools that can
    /// run unattended. Returns the outcome of the last model call.
    pub async fn drive(&self, tab_id: &str) -> RunOutcome {
        let max_steps = self
            .store
            .tab_state(tab_id)
            .map(|s| s.max_steps.max(1))
            .unwrap_or(1);
        let mut outcome = RunOutcome::Completed;
        for step in 0..max_steps {
            outcome = self.runner.run(&self.store, tab_id).await;
            if outcome == RunOutcome::AlreadyRunning {
                break;
            }
            let deferred = self.deferred.lock().remove(tab_id);
            if outcome != RunOutcome::Completed {
                break;
            }
            let mut settled = self.approvals.auto_resolve(&self.store, tab_id).await;
            if deferred && !settled {
                settled = self
                    .store
                    .tab_state(tab_id)
                    .is_some_and(|s| !has_pending_invocations(&s.messages));
            }
            if !settled {
                debug!("tab {tab_id}: drive ends after step {}", step + 1);
                break;
            }
            if step + 1 == max_steps {
                info!("tab {tab_id}: reached {max_steps} steps");
            }
        }
        outcome
    }

    async fn continue_if_settled(&self, tab_id: &str, resolution: Resolution) -> Resolution {
        if resolution != Resolution::Settled {
            return resolution;
        }
        while self.drive(tab_id).await == RunOutcome::AlreadyRunning {
            self.deferred.lock().insert(tab_id.to_string());
            let running = self.store.tab_state(tab_id).is_some_and(|s| s.running);
            // the run may have ended before the mark was set
            if running || !self.deferred.lock().remove(tab_id) {
                break;
            }
        }
        resolution
    }

    pub async fn approve(&self, tool_call_id: &str) -> Resolution {
        let tab = self.store.current_tab_id();
        let resolution = self.approvals.approve(&self.store, &tab, tool_call_id).await;
        self.continue_if_settled(&tab, resolution).await
    }

    pub async fn reject(&self, tool_call_id: &str) -> Resolution {
        let tab = self.store.current_tab_id();
        let resolution = self.approvals.reject(&self.store, &tab, tool_call_id);
        self.continue_if_settled(&tab, resolution).await
    }

    /// Stores a result produced outside the approval flow.
    pub async fn add_tool_result(&self, tool_call_id: &str, result: ToolResult) -> Resolution {
        let tab = self.store.current_tab_id();
        let resolution = self.store.add_tool_result_to(&tab, tool_call_id, result);
        self.continue_if_settled(&tab, resolution).await
    }

    pub async fn rerun_from_message(&self, index: usize) -> Option<RunOutcome> {
        let tab = self.store.rerun_from_message(index)?;
        Some(self.drive(&tab).await)
    }

    pub fn stop(&self) -> bool {
        let tab = self.store.current_tab_id();
        self.runner.stop(&self.store, &tab)
    }

    /// Clears the current conversation and the claims on its tool calls.
    pub fn clear_conversation(&self) {
        let tab = self.store.current_tab_id();
        self.store.clear_conversation();
        self.forget(&tab);
    }

    pub fn close_tab(&self, tab_id: &str) -> bool {
        let closed = self.store.close_tab(tab_id);
        if closed {
            self.forget(tab_id);
        }
        closed
    }

    fn forget(&self, tab_id: &str) {
        self.approvals.forget_tab(tab_id);
        self.deferred.lock().remove(tab_id);
    }

    pub fn undo(&self) -> Option<String> {
        let description = self.store.undo()?;
        self.release_pending();
        Some(description)
    }

    pub fn redo(&self) -> Option<String> {
        let description = self.store.redo()?;
        self.release_pending();
        Some(description)
    }

    /// Invocations restored to `call` by undo or redo can be decided again.
    fn release_pending(&self) {
        let tab = self.store.current_tab_id();
        let state = self.store.current_state();
        if !has_pending_invocations(&state.messages) {
            return;
        }
        let ids = state
            .messages
            .iter()
            .flat_map(|m| m.tool_invocations())
            .filter(|t| t.is_pending())
            .map(|t| t.tool_call_id.clone());
        self.approvals.release(&tab, ids);
    }

    /// Saves the current tab (or its cut range) into a dataset.
    pub async fn capture(
        &self,
        datasets: &dyn DatasetClient,
        dataset_id: &str,
        name: impl Into<String>,
    ) -> anyhow::Result<Envelope<DatasetItem>> {
        let item = DatasetItem::capture(&self.store.current_state(), name);
        datasets.add_item(dataset_id, item).await
    }
}

/// Writes the store to `storage` whenever it changes. Bursts of changes
/// collapse into one write of the latest state. Ends when the store is
/// dropped.
pub fn spawn_persistence(store: &Arc<PlaygroundStore>, storage: Arc<dyn Storage>) -> JoinHandle<()> {
    let weak = Arc::downgrade(store);
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let Some(store) = weak.upgrade() else { break };
            let snapshot = store.persisted();
            drop(store);
            if let Err(e) = storage.save_playground(&snapshot).await {
                warn!("failed to persist playground: {e:#}");
            }
        }
        debug!("persistence task finished");
    })
}

/// Spawns a drive on its own task.
pub fn spawn_drive(playground: &Arc<Playground>, tab_id: TabId) -> JoinHandle<RunOutcome> {
    let playground = playground.clone();
    tokio::spawn(async move { playground.drive(&tab_id).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{Script, ScriptedProvider, text_turn, tool_turn};
    use crate::agent::APOLOGY;
    use crate::dataset::FileDatasets;
    use crate::mcp::host::tests::echo_host;
    use crate::llm::StreamEvent;
    use crate::message::{InvocationState, ToolInvocation, find_invocation};
    use crate::storage::MemoryStorage;
    use crate::store::StoreConfig;
    use crate::toolbox::{DENIED_MESSAGE, McpToolBox};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup(scripts: Vec<Script>) -> (Playground, Arc<ScriptedProvider>) {
        let toolbox = McpToolBox::new(Arc::new(echo_host()));
        let catalog = toolbox.refresh().await;
        let store = PlaygroundStore::new(StoreConfig::default());
        store.set_tool_catalogs(catalog);
        store.update_enabled_tools("echo", vec!["look".into(), "write".into()]);
        let provider = ScriptedProvider::new(scripts);
        let config = PlaygroundConfig {
            auto_approve_delay_ms: 0,
            ..Default::default()
        };
        let playground = Playground::new(store, provider.clone(), Arc::new(toolbox), &config);
        (playground, provider)
    }

    fn texts(p: &Playground) -> Vec<String> {
        p.store().current_state().messages.iter().map(|m| m.text()).collect()
    }

    #[tokio::test]
    async fn read_tools_loop_back_into_the_model() {
        let (p, provider) = setup(vec![tool_turn(&[("r1", "echo--look")]), text_turn("found it")]).await;
        assert_eq!(p.send("look around").await, RunOutcome::Completed);
        assert_eq!(provider.calls(), 2);

        let state = p.store().current_state();
        let r1 = find_invocation(&state.messages, "r1").unwrap();
        assert_eq!(r1.state, InvocationState::Result);
        assert_eq!(texts(&p).last().unwrap(), "found it");
        // the second call saw the tool result
        let second = provider.requests.lock()[1].clone();
        assert_eq!(second.messages.len(), 2);
    }

    #[tokio::test]
    async fn runner_resumes_once_after_last_pending_call() {
        let (p, provider) = setup(vec![
            tool_turn(&[("w1", "echo--write"), ("w2", "echo--write")]),
            text_turn("both done"),
        ])
        .await;
        p.send("write twice").await;
        assert_eq!(provider.calls(), 1);

        assert_eq!(p.approve("w1").await, Resolution::Pending);
        assert_eq!(provider.calls(), 1);

        assert_eq!(p.reject("w2").await, Resolution::Settled);
        assert_eq!(provider.calls(), 2);

        // repeating either decision changes nothing
        assert_eq!(p.approve("w1").await, Resolution::NotFound);
        assert_eq!(p.reject("w2").await, Resolution::NotFound);
        assert_eq!(provider.calls(), 2);

        let state = p.store().current_state();
        let w2 = find_invocation(&state.messages, "w2").unwrap();
        assert_eq!(w2.result.as_ref().unwrap().message, DENIED_MESSAGE);
        assert_eq!(texts(&p).last().unwrap(), "both done");
    }

    #[tokio::test]
    async fn drives_are_capped_by_max_steps() {
        let scripts = (0..10)
            .map(|i| {
                let id = format!("r{i}");
                tool_turn(&[(id.as_str(), "echo--look")])
            })
            .collect();
        let (p, provider) = setup(scripts).await;
        p.store().update_max_steps(3);
        p.send("loop").await;
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn rerun_truncates_and_runs_again() {
        let (p, provider) = setup(vec![]).await;
        for t in ["0", "1", "2", "3", "4"] {
            p.store().add_message(Message::user(t));
        }
        assert_eq!(p.rerun_from_message(2).await, Some(RunOutcome::Completed));
        assert_eq!(provider.calls(), 1);
        assert_eq!(texts(&p), vec!["0", "1", "2", "ok"]);
        assert_eq!(provider.requests.lock()[0].messages.len(), 3);
        assert_eq!(p.rerun_from_message(9).await, None);
    }

    #[tokio::test]
    async fn undo_reopens_decided_calls() {
        let (p, _) = setup(vec![tool_turn(&[("w1", "echo--write")])]).await;
        p.send("write").await;
        // checkpoint while w1 waits
        p.store().commit("Waiting", |_| {});
        p.store().add_message(Message::user("later"));
        assert_eq!(p.reject("w1").await, Resolution::Settled);

        assert_eq!(p.undo().as_deref(), Some("Waiting"));
        let state = p.store().current_state();
        assert!(find_invocation(&state.messages, "w1").unwrap().is_pending());
        assert_eq!(p.reject("w1").await, Resolution::Settled);
    }

    fn push_write_call(p: &Playground, id: &str) {
        let inv = ToolInvocation::call(id, "echo--write", json!({}));
        p.store().apply(|s| s.messages.push(Message::tool_invocation(inv)));
    }

    #[tokio::test]
    async fn sends_wait_and_settled_calls_defer_while_running() {
        let (p, provider) = setup(vec![Script::Hang(vec![])]).await;
        let p = Arc::new(p);
        let tab = p.store().current_tab_id();
        push_write_call(&p, "w1");
        let before = p.store().current_state().messages;

        let drive = spawn_drive(&p, tab.clone());
        while provider.calls() < 1 {
            tokio::task::yield_now().await;
        }
        assert_eq!(p.send("are you there").await, RunOutcome::AlreadyRunning);
        assert_eq!(p.store().current_state().messages, before);

        assert_eq!(p.reject("w1").await, Resolution::Settled);
        assert_eq!(provider.calls(), 1);

        // the running drive picks the settled call up once its turn ends
        provider.push(0, StreamEvent::Finish { usage: None });
        assert_eq!(drive.await.unwrap(), RunOutcome::Completed);
        assert_eq!(provider.calls(), 2);
        assert_eq!(texts(&p).last().unwrap(), "ok");
    }

    #[tokio::test]
    async fn clear_and_close_forget_claims() {
        let (p, _) = setup(vec![]).await;
        let first = p.store().current_tab_id();
        push_write_call(&p, "w1");
        p.approvals.reject(p.store(), &first, "w1");
        assert!(p.approvals.is_claimed(&first, "w1"));
        p.clear_conversation();
        assert!(!p.approvals.is_claimed(&first, "w1"));

        let second = p.store().new_tab("second");
        push_write_call(&p, "w2");
        p.approvals.reject(p.store(), &second, "w2");
        assert!(p.close_tab(&second));
        assert!(!p.approvals.is_claimed(&second, "w2"));
        assert!(!p.close_tab(&second));
    }

    #[tokio::test]
    async fn failed_runs_end_the_drive() {
        let (p, provider) = setup(vec![Script::Refuse("offline".into())]).await;
        assert_eq!(p.send("hi").await, RunOutcome::Failed);
        assert_eq!(provider.calls(), 1);
        assert_eq!(texts(&p), vec!["hi", APOLOGY]);
    }

    #[tokio::test]
    async fn capture_writes_an_item() {
        let dir = tempfile::tempdir().unwrap();
        let datasets = FileDatasets::new(dir.path().join("datasets.json"));
        let ds = datasets.create_dataset("evals", "").await.unwrap().into_result().unwrap();
        let (p, _) = setup(vec![]).await;
        p.send("hi").await;

        let item = p.capture(&datasets, &ds.id, "greeting").await.unwrap().into_result().unwrap();
        assert_eq!(item.messages.len(), 2);
        let stored = datasets.list_items(&ds.id).await.unwrap().into_result().unwrap();
        assert_eq!(stored, vec![item]);
    }

    #[tokio::test]
    async fn persistence_follows_the_store() {
        let storage = Arc::new(MemoryStorage::new());
        let store = PlaygroundStore::new(StoreConfig::default());
        let task = spawn_persistence(&store, storage.clone());

        store.add_message(Message::user("hi"));
        store.update_system_prompt("short");
        while storage
            .load_playground()
            .await
            .unwrap()
            .is_none_or(|p| p.tabs[0].state.system_prompt != "short")
        {
            tokio::task::yield_now().await;
        }
        let saved = storage.load_playground().await.unwrap().unwrap();
        assert_eq!(saved.tabs[0].state.messages.len(), 1);
        assert!(storage.playground_saves() >= 1);

        drop(store);
        task.await.unwrap();
    }
}
