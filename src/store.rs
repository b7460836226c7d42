//! The tab store.
//!
//! All tab state lives here and every change goes through
//! [`PlaygroundStore::update_tab`]. Changes come in two forms:
//! [`apply`](PlaygroundStore::apply) for transient updates and
//! [`commit`](PlaygroundStore::commit) for undoable checkpoints. Subscribers
//! get a revision number bumped on every change.

use std::sync::Arc;

use futures::future::AbortHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mcp::McpTool;
use crate::message::{Message, has_pending_invocations};
use crate::tab::{ActiveRun, MAX_HISTORY, ModelSettings, Tab, TabId, TabState};
use crate::tool_override::ToolOverride;
use crate::toolbox::ToolResult;
use crate::toolset::ToolCatalog;

pub const DEFAULT_TAB_NAME: &str = "New Tab";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// State new tabs start from.
    pub defaults: TabState,
    pub max_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            defaults: TabState::default(),
            max_history: MAX_HISTORY,
        }
    }
}

/// What gets written to storage under `playground-store`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStore {
    #[serde(default)]
    pub tabs: Vec<Tab>,
    #[serde(default)]
    pub current_tab_id: Option<TabId>,
    #[serde(default)]
    pub auto_execute_tools: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSummary {
    pub id: TabId,
    pub name: String,
    pub running: bool,
    pub message_count: usize,
    pub current: bool,
}

/// Outcome of [`PlaygroundStore::add_tool_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No pending invocation with that id; nothing changed.
    NotFound,
    /// Resolved, other invocations are still pending.
    Pending,
    /// Resolved and nothing is pending any more. The agent should continue.
    Settled,
}

struct Inner {
    tabs: Vec<Tab>,
    current_tab_id: TabId,
    tool_catalog: ToolCatalog,
    auto_execute_tools: bool,
}

impl Inner {
    fn tab(&self, id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == id)
    }

    fn tab_mut(&mut self, id: &str) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    fn current_mut(&mut self) -> Option<&mut Tab> {
        let id = self.current_tab_id.clone();
        self.tab_mut(&id)
    }
}

pub struct PlaygroundStore {
    inner: Mutex<Inner>,
    config: StoreConfig,
    revision: watch::Sender<u64>,
}

fn new_tab_id() -> TabId {
    Uuid::new_v4().to_string()
}

impl PlaygroundStore {
    /// A store with a single empty tab.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        let tab = Tab::new(new_tab_id(), DEFAULT_TAB_NAME, config.defaults.clone());
        let inner = Inner {
            current_tab_id: tab.id.clone(),
            tabs: vec![tab],
            tool_catalog: ToolCatalog::new(),
            auto_execute_tools: false,
        };
        Self::from_inner(inner, config)
    }

    /// Rebuilds a store from storage. Stored data is trusted apart from the
    /// fixes needed to keep it usable.
    pub fn restore(config: StoreConfig, persisted: PersistedStore) -> Arc<Self> {
        let PersistedStore {
            mut tabs,
            current_tab_id,
            auto_execute_tools,
        } = persisted;
        for tab in tabs.iter_mut() {
            tab.repair();
        }
        if tabs.is_empty() {
            tabs.push(Tab::new(new_tab_id(), DEFAULT_TAB_NAME, config.defaults.clone()));
        }
        let current_tab_id = match current_tab_id {
            Some(id) if tabs.iter().any(|t| t.id == id) => id,
            _ => tabs[0].id.clone(),
        };
        let inner = Inner {
            tabs,
            current_tab_id,
            tool_catalog: ToolCatalog::new(),
            auto_execute_tools,
        };
        Self::from_inner(inner, config)
    }

    fn from_inner(inner: Inner, config: StoreConfig) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(inner),
            config,
            revision,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn notify(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub fn persisted(&self) -> PersistedStore {
        let inner = self.inner.lock();
        PersistedStore {
            tabs: inner.tabs.clone(),
            current_tab_id: Some(inner.current_tab_id.clone()),
            auto_execute_tools: inner.auto_execute_tools,
        }
    }

    // ---- the single mutation path ----

    /// Runs `mutation` on a tab's state (`None` = current tab). With a label
    /// the result is recorded as a history checkpoint.
    ///
    /// Returns `None` when the tab does not exist.
    pub fn update_tab<R>(
        &self,
        tab_id: Option<&str>,
        label: Option<&str>,
        mutation: impl FnOnce(&mut TabState) -> R,
    ) -> Option<R> {
        self.update_tab_checked(tab_id, label, |s| (mutation(s), true))
    }

    /// [`update_tab`](Self::update_tab) where the mutation also reports
    /// whether it changed anything. The checkpoint is only recorded on change.
    fn update_tab_checked<R>(
        &self,
        tab_id: Option<&str>,
        label: Option<&str>,
        mutation: impl FnOnce(&mut TabState) -> (R, bool),
    ) -> Option<R> {
        let res = {
            let mut inner = self.inner.lock();
            let tab = match tab_id {
                Some(id) => inner.tab_mut(id),
                None => inner.current_mut(),
            };
            let Some(tab) = tab else {
                debug!("update on missing tab {tab_id:?}");
                return None;
            };
            let (res, changed) = mutation(&mut tab.state);
            if let (Some(label), true) = (label, changed) {
                tab.record(label, self.config.max_history);
            }
            res
        };
        self.notify();
        Some(res)
    }

    pub fn apply<R>(&self, mutation: impl FnOnce(&mut TabState) -> R) -> Option<R> {
        self.update_tab(None, None, mutation)
    }

    pub fn apply_to<R>(&self, tab_id: &str, mutation: impl FnOnce(&mut TabState) -> R) -> Option<R> {
        self.update_tab(Some(tab_id), None, mutation)
    }

    pub fn commit<R>(&self, label: &str, mutation: impl FnOnce(&mut TabState) -> R) -> Option<R> {
        self.update_tab(None, Some(label), mutation)
    }

    pub fn commit_to<R>(&self, tab_id: &str, label: &str, mutation: impl FnOnce(&mut TabState) -> R) -> Option<R> {
        self.update_tab(Some(tab_id), Some(label), mutation)
    }

    /// Mutation on the tab itself rather than its state.
    fn with_tab<R>(&self, tab_id: &str, f: impl FnOnce(&mut Tab) -> R) -> Option<R> {
        let res = {
            let mut inner = self.inner.lock();
            let tab = inner.tab_mut(tab_id)?;
            f(tab)
        };
        self.notify();
        Some(res)
    }

    // ---- reads ----

    pub fn current_tab_id(&self) -> TabId {
        self.inner.lock().current_tab_id.clone()
    }

    pub fn current_state(&self) -> TabState {
        let inner = self.inner.lock();
        inner
            .tab(&inner.current_tab_id)
            .map(|t| t.state.clone())
            .unwrap_or_default()
    }

    pub fn tab_state(&self, tab_id: &str) -> Option<TabState> {
        self.inner.lock().tab(tab_id).map(|t| t.state.clone())
    }

    pub fn tab(&self, tab_id: &str) -> Option<Tab> {
        self.inner.lock().tab(tab_id).cloned()
    }

    pub fn tabs(&self) -> Vec<TabSummary> {
        let inner = self.inner.lock();
        inner
            .tabs
            .iter()
            .map(|t| TabSummary {
                id: t.id.clone(),
                name: t.name.clone(),
                running: t.state.running,
                message_count: t.state.messages.len(),
                current: t.id == inner.current_tab_id,
            })
            .collect()
    }

    // ---- tabs ----

    /// Opens a tab starting from the configured defaults as modified by
    /// `init`, and makes it current.
    pub fn create_tab(&self, name: impl Into<String>, init: impl FnOnce(&mut TabState)) -> TabId {
        let mut state = self.config.defaults.clone();
        init(&mut state);
        state.running = false;
        let tab = Tab::new(new_tab_id(), name, state);
        let id = tab.id.clone();
        {
            let mut inner = self.inner.lock();
            inner.tabs.push(tab);
            inner.current_tab_id = id.clone();
        }
        self.notify();
        id
    }

    pub fn new_tab(&self, name: impl Into<String>) -> TabId {
        self.create_tab(name, |_| {})
    }

    /// Copies configuration and messages (not history) into a new current tab.
    pub fn duplicate_tab(&self, tab_id: &str) -> Option<TabId> {
        let (name, source) = {
            let inner = self.inner.lock();
            let tab = inner.tab(tab_id)?;
            (tab.name.clone(), tab.state.clone())
        };
        Some(self.create_tab(format!("{name} (copy)"), move |s| {
            s.credential_id = source.credential_id;
            s.model = source.model;
            s.settings = source.settings;
            s.system_prompt = source.system_prompt;
            s.messages = source.messages;
            s.enabled_tools = source.enabled_tools;
            s.modified_tools = source.modified_tools;
            s.max_steps = source.max_steps;
        }))
    }

    /// Closes a tab. Aborts its run if one is in flight. Closing the last tab
    /// opens a fresh one.
    pub fn close_tab(&self, tab_id: &str) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(pos) = inner.tabs.iter().position(|t| t.id == tab_id) else {
                return false;
            };
            let mut tab = inner.tabs.remove(pos);
            tab.cancel_run();
            if inner.tabs.is_empty() {
                inner
                    .tabs
                    .push(Tab::new(new_tab_id(), DEFAULT_TAB_NAME, self.config.defaults.clone()));
            }
            if inner.current_tab_id == tab_id {
                let next = pos.min(inner.tabs.len() - 1);
                inner.current_tab_id = inner.tabs[next].id.clone();
            }
        }
        self.notify();
        true
    }

    pub fn rename_tab(&self, tab_id: &str, name: impl Into<String>) -> bool {
        let name = name.into();
        self.with_tab(tab_id, |t| t.name = name).is_some()
    }

    pub fn set_current_tab(&self, tab_id: &str) -> bool {
        let found = {
            let mut inner = self.inner.lock();
            if inner.tab(tab_id).is_some() {
                inner.current_tab_id = tab_id.to_string();
                true
            } else {
                false
            }
        };
        if found {
            self.notify();
        }
        found
    }

    // ---- history ----

    pub fn undo(&self) -> Option<String> {
        let id = self.current_tab_id();
        self.with_tab(&id, |t| t.undo()).flatten()
    }

    pub fn redo(&self) -> Option<String> {
        let id = self.current_tab_id();
        self.with_tab(&id, |t| t.redo()).flatten()
    }

    pub fn can_undo(&self) -> bool {
        let inner = self.inner.lock();
        inner.tab(&inner.current_tab_id).is_some_and(|t| t.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        let inner = self.inner.lock();
        inner.tab(&inner.current_tab_id).is_some_and(|t| t.can_redo())
    }

    /// Empties the conversation but keeps its configuration. History starts
    /// over from the cleared state.
    pub fn clear_conversation(&self) {
        let id = self.current_tab_id();
        self.with_tab(&id, |t| {
            t.cancel_run();
            t.state = t.state.cleared();
            t.reset_history("Cleared conversation");
        });
    }

    // ---- messages ----

    pub fn add_message(&self, message: Message) {
        let id = self.current_tab_id();
        self.add_message_to(&id, message);
    }

    pub fn add_message_to(&self, tab_id: &str, mut message: Message) {
        message.ensure_id();
        let label = format!("Added message: {}", message.role);
        self.commit_to(tab_id, &label, move |s| s.messages.push(message));
    }

    /// Adds `message` unless the tab has a run in flight, whose request
    /// could no longer include it. Returns false when nothing was added.
    pub fn add_message_when_idle(&self, tab_id: &str, mut message: Message) -> bool {
        message.ensure_id();
        let label = format!("Added message: {}", message.role);
        self.update_tab_checked(Some(tab_id), Some(&label), move |s| {
            if s.running {
                return (false, false);
            }
            s.messages.push(message);
            (true, true)
        })
        .unwrap_or(false)
    }

    /// Removes the message at `index`. Out of range is a no-op.
    pub fn delete_message(&self, index: usize) -> bool {
        let removed = self
            .update_tab_checked(None, Some(&format!("Deleted message {}", index + 1)), |s| {
                let found = index < s.messages.len();
                if found {
                    s.messages.remove(index);
                }
                (found, found)
            })
            .unwrap_or(false);
        if !removed {
            warn!("delete_message: index {index} out of range");
        }
        removed
    }

    /// Keeps messages up to and including `index`. The caller reruns the
    /// agent afterwards.
    pub fn rerun_from_message(&self, index: usize) -> Option<TabId> {
        let id = self.current_tab_id();
        let state = self.tab_state(&id)?;
        if index >= state.messages.len() {
            warn!("rerun_from_message: index {index} out of range");
            return None;
        }
        self.commit_to(&id, &format!("Rerun from message {}", index + 1), |s| {
            s.messages.truncate(index + 1);
        })?;
        Some(id)
    }

    /// Stores a tool result on the pending invocation with `tool_call_id`.
    /// Not an undo checkpoint.
    pub fn add_tool_result(&self, tool_call_id: &str, result: ToolResult) -> Resolution {
        let id = self.current_tab_id();
        self.add_tool_result_to(&id, tool_call_id, result)
    }

    pub fn add_tool_result_to(&self, tab_id: &str, tool_call_id: &str, result: ToolResult) -> Resolution {
        let resolution = {
            let mut inner = self.inner.lock();
            let Some(tab) = inner.tab_mut(tab_id) else {
                return Resolution::NotFound;
            };
            let invocation = tab
                .state
                .messages
                .iter_mut()
                .find_map(|m| m.tool_invocation_mut(tool_call_id))
                .filter(|inv| inv.is_pending());
            let Some(invocation) = invocation else {
                debug!("no pending tool invocation {tool_call_id}");
                return Resolution::NotFound;
            };
            invocation.resolve(result);
            if has_pending_invocations(&tab.state.messages) {
                Resolution::Pending
            } else {
                Resolution::Settled
            }
        };
        self.notify();
        resolution
    }

    // ---- configuration (untracked) ----

    pub fn update_enabled_tools(&self, provider_id: &str, tools: Vec<String>) {
        self.apply(|s| {
            if tools.is_empty() {
                s.enabled_tools.remove(provider_id);
            } else {
                s.enabled_tools.insert(provider_id.to_string(), tools);
            }
        });
    }

    pub fn modify_tool(&self, provider_id: &str, tool_name: &str, tool_override: ToolOverride) {
        if tool_override.is_noop() {
            self.revert_tool(provider_id, tool_name);
            return;
        }
        self.apply(|s| {
            s.modified_tools
                .entry(provider_id.to_string())
                .or_default()
                .insert(tool_name.to_string(), tool_override);
        });
    }

    pub fn revert_tool(&self, provider_id: &str, tool_name: &str) {
        self.apply(|s| {
            if let Some(tools) = s.modified_tools.get_mut(provider_id) {
                tools.remove(tool_name);
                if tools.is_empty() {
                    s.modified_tools.remove(provider_id);
                }
            }
        });
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut ModelSettings)) {
        self.apply(|s| f(&mut s.settings));
    }

    pub fn update_system_prompt(&self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.apply(|s| s.system_prompt = prompt);
    }

    pub fn update_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.apply(|s| s.model = model);
    }

    pub fn update_credential(&self, credential_id: Option<String>) {
        self.apply(|s| s.credential_id = credential_id);
    }

    pub fn update_max_steps(&self, max_steps: u32) {
        self.apply(|s| s.max_steps = max_steps.max(1));
    }

    pub fn toggle_cut_mode(&self) -> bool {
        self.apply(|s| {
            s.cut.enabled = !s.cut.enabled;
            s.cut.enabled
        })
        .unwrap_or(false)
    }

    pub fn set_cut(&self, start: Option<usize>, end: Option<usize>) {
        self.apply(|s| {
            s.cut.start = start;
            s.cut.end = end;
        });
    }

    // ---- store-wide ----

    pub fn set_tool_catalog(&self, provider_id: &str, tools: Vec<McpTool>) {
        self.inner.lock().tool_catalog.insert(provider_id.to_string(), tools);
        self.notify();
    }

    pub fn set_tool_catalogs(&self, catalog: ToolCatalog) {
        self.inner.lock().tool_catalog = catalog;
        self.notify();
    }

    pub fn tool_catalog(&self) -> ToolCatalog {
        self.inner.lock().tool_catalog.clone()
    }

    pub fn auto_execute_tools(&self) -> bool {
        self.inner.lock().auto_execute_tools
    }

    pub fn set_auto_execute_tools(&self, on: bool) {
        self.inner.lock().auto_execute_tools = on;
        self.notify();
    }

    // ---- run bookkeeping ----

    /// Marks a tab running. Returns the run id, `Some(None)` if a run is
    /// already in flight, `None` if the tab is gone.
    pub(crate) fn begin_run(&self, tab_id: &str, abort: AbortHandle) -> Option<Option<u64>> {
        let started = {
            let mut inner = self.inner.lock();
            let tab = inner.tab_mut(tab_id)?;
            if tab.state.running {
                None
            } else {
                let run = ActiveRun::new(abort);
                let id = run.id;
                tab.state.running = true;
                tab.run = Some(run);
                Some(id)
            }
        };
        self.notify();
        Some(started)
    }

    /// Clears the run flag if run `run_id` is still the tab's run. A run
    /// cancelled by undo, redo or stop leaves its successor alone.
    pub(crate) fn end_run(&self, tab_id: &str, run_id: u64) {
        let ended = {
            let mut inner = self.inner.lock();
            match inner.tab_mut(tab_id) {
                Some(t) if t.run.as_ref().is_some_and(|r| r.id == run_id) => {
                    t.run = None;
                    t.state.running = false;
                    true
                }
                _ => false,
            }
        };
        if ended {
            self.notify();
        }
    }

    /// Aborts the tab's run and clears `running` whether or not a run was
    /// found.
    pub fn stop(&self, tab_id: &str) -> bool {
        self.with_tab(tab_id, |t| t.cancel_run()).unwrap_or(false)
    }
}
