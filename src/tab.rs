//! Tabs, their conversation state and undo history.

use std::collections::BTreeMap;
use std::ops::{AddAssign, Range};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::AbortHandle;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tool_override::ToolOverrides;

pub type TabId = String;

pub const MAX_HISTORY: usize = 100;
pub const INITIAL_STATE: &str = "Initial state";
pub const DEFAULT_MAX_STEPS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// Message range selected for dataset export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CutSelection {
    pub enabled: bool,
    pub start: Option<usize>,
    /// Inclusive.
    pub end: Option<usize>,
}

impl CutSelection {
    /// The selected range clamped to `len` messages. Whole log when disabled.
    pub fn range(&self, len: usize) -> Range<usize> {
        if !self.enabled {
            return 0..len;
        }
        let start = self.start.unwrap_or(0).min(len);
        let end = self.end.map(|e| e.saturating_add(1)).unwrap_or(len).min(len);
        start..end.max(start)
    }
}

/// Everything that makes up one conversation. History entries are snapshots
/// of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TabState {
    pub credential_id: Option<String>,
    pub model: String,
    pub settings: ModelSettings,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    /// provider id -> enabled tool names
    pub enabled_tools: BTreeMap<String, Vec<String>>,
    #[serde(rename = "modifiedToolMap")]
    pub modified_tools: ToolOverrides,
    #[serde(skip)]
    pub running: bool,
    pub max_steps: u32,
    pub token_usage: Option<TokenUsage>,
    pub latency_ms: Option<u64>,
    pub cut: CutSelection,
}

impl Default for TabState {
    fn default() -> Self {
        Self {
            credential_id: None,
            model: String::new(),
            settings: ModelSettings::default(),
            system_prompt: String::new(),
            messages: vec![],
            enabled_tools: BTreeMap::new(),
            modified_tools: ToolOverrides::new(),
            running: false,
            max_steps: DEFAULT_MAX_STEPS,
            token_usage: None,
            latency_ms: None,
            cut: CutSelection::default(),
        }
    }
}

impl TabState {
    /// Same configuration, empty conversation.
    pub fn cleared(&self) -> Self {
        Self {
            credential_id: self.credential_id.clone(),
            model: self.model.clone(),
            settings: self.settings.clone(),
            system_prompt: self.system_prompt.clone(),
            enabled_tools: self.enabled_tools.clone(),
            modified_tools: self.modified_tools.clone(),
            max_steps: self.max_steps,
            ..Default::default()
        }
    }

    pub fn cut_messages(&self) -> &[Message] {
        &self.messages[self.cut.range(self.messages.len())]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: TabState,
    pub description: String,
}

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// An agent run in flight on a tab.
#[derive(Debug, Clone)]
pub(crate) struct ActiveRun {
    pub(crate) id: u64,
    pub(crate) abort: AbortHandle,
}

impl ActiveRun {
    pub(crate) fn new(abort: AbortHandle) -> Self {
        Self {
            id: NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed),
            abort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: TabId,
    pub name: String,
    pub state: TabState,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub history_index: usize,
    /// The in-flight agent run, if any.
    #[serde(skip)]
    pub(crate) run: Option<ActiveRun>,
}

impl Tab {
    pub fn new(id: impl Into<TabId>, name: impl Into<String>, state: TabState) -> Self {
        let mut tab = Self {
            id: id.into(),
            name: name.into(),
            state,
            history: vec![],
            history_index: 0,
            run: None,
        };
        tab.reset_history(INITIAL_STATE);
        tab
    }

    pub fn reset_history(&mut self, description: &str) {
        self.history = vec![HistoryEntry {
            state: self.state.clone(),
            description: description.to_string(),
        }];
        self.history_index = 0;
    }

    /// Snapshots the live state, dropping any redo tail.
    pub fn record(&mut self, description: &str, max_history: usize) {
        let keep = (self.history_index + 1).min(self.history.len());
        self.history.truncate(keep);
        self.history.push(HistoryEntry {
            state: self.state.clone(),
            description: description.to_string(),
        });
        let max_history = max_history.max(1);
        if self.history.len() > max_history {
            let excess = self.history.len() - max_history;
            self.history.drain(..excess);
        }
        self.history_index = self.history.len() - 1;
    }

    pub fn can_undo(&self) -> bool {
        self.history_index > 0 && self.history_index < self.history.len()
    }

    pub fn can_redo(&self) -> bool {
        self.history_index + 1 < self.history.len()
    }

    /// Aborts the in-flight run and clears `running`. True if a run was
    /// aborted.
    pub(crate) fn cancel_run(&mut self) -> bool {
        self.state.running = false;
        match self.run.take() {
            Some(run) => {
                run.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Moves one entry back. A run in flight is aborted since its output
    /// belongs to the state being left.
    pub fn undo(&mut self) -> Option<String> {
        if !self.can_undo() {
            return None;
        }
        self.cancel_run();
        self.history_index -= 1;
        Some(self.restore_current())
    }

    pub fn redo(&mut self) -> Option<String> {
        if !self.can_redo() {
            return None;
        }
        self.cancel_run();
        self.history_index += 1;
        Some(self.restore_current())
    }

    fn restore_current(&mut self) -> String {
        let entry = &self.history[self.history_index];
        self.state = entry.state.clone();
        self.state.running = false;
        entry.description.clone()
    }

    /// Fixes up a tab read back from storage.
    pub(crate) fn repair(&mut self) {
        self.state.running = false;
        if self.history.is_empty() {
            self.reset_history(INITIAL_STATE);
        }
        if self.history_index >= self.history.len() {
            self.history_index = self.history.len() - 1;
        }
    }
}
