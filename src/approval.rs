//! Resolving tool invocations that wait in `call` state.
//!
//! Read tools run as soon as they are seen. Write tools wait for
//! [`ToolApprovals::approve`] or [`ToolApprovals::reject`] unless
//! auto-execution is on. Each invocation is claimed before anything runs so
//! it is submitted at most once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::message::{ToolInvocation, awaiting_invocations, find_invocation};
use crate::store::{PlaygroundStore, Resolution};
use crate::tab::TabId;
use crate::toolbox::{AgentToolBox, ToolKind, ToolResult};

pub struct ToolApprovals {
    toolbox: Arc<dyn AgentToolBox>,
    /// (tab, tool call) pairs already submitted or in flight.
    processed: Mutex<HashSet<(TabId, String)>>,
    write_delay: Duration,
}

impl ToolApprovals {
    pub fn new(toolbox: Arc<dyn AgentToolBox>, write_delay: Duration) -> Self {
        Self {
            toolbox,
            processed: Mutex::new(HashSet::new()),
            write_delay,
        }
    }

    fn claim(&self, tab_id: &str, tool_call_id: &str) -> bool {
        self.processed
            .lock()
            .insert((tab_id.to_string(), tool_call_id.to_string()))
    }

    /// Forgets claims so invocations that became pending again (after undo or
    /// redo) can be resolved once more.
    pub fn release(&self, tab_id: &str, tool_call_ids: impl IntoIterator<Item = String>) {
        let mut processed = self.processed.lock();
        for id in tool_call_ids {
            processed.remove(&(tab_id.to_string(), id));
        }
    }

    /// Drops every claim on a tab whose conversation was cleared or closed.
    pub fn forget_tab(&self, tab_id: &str) {
        self.processed.lock().retain(|(tab, _)| tab != tab_id);
    }

    #[cfg(test)]
    pub(crate) fn is_claimed(&self, tab_id: &str, tool_call_id: &str) -> bool {
        self.processed
            .lock()
            .contains(&(tab_id.to_string(), tool_call_id.to_string()))
    }

    fn pending(store: &PlaygroundStore, tab_id: &str, tool_call_id: &str) -> Option<ToolInvocation> {
        let state = store.tab_state(tab_id)?;
        find_invocation(&state.messages, tool_call_id)
            .filter(|inv| inv.is_pending())
            .cloned()
    }

    /// Runs an invocation the user approved.
    pub async fn approve(&self, store: &PlaygroundStore, tab_id: &str, tool_call_id: &str) -> Resolution {
        let Some(invocation) = Self::pending(store, tab_id, tool_call_id) else {
            debug!("approve: no pending invocation {tool_call_id}");
            return Resolution::NotFound;
        };
        if !self.claim(tab_id, tool_call_id) {
            debug!("approve: {tool_call_id} already handled");
            return Resolution::NotFound;
        }
        let result = self.execute(&invocation).await;
        store.add_tool_result_to(tab_id, tool_call_id, result)
    }

    pub fn reject(&self, store: &PlaygroundStore, tab_id: &str, tool_call_id: &str) -> Resolution {
        if Self::pending(store, tab_id, tool_call_id).is_none() || !self.claim(tab_id, tool_call_id) {
            return Resolution::NotFound;
        }
        info!("tool call {tool_call_id} rejected");
        store.add_tool_result_to(tab_id, tool_call_id, ToolResult::denied())
    }

    /// Resolves every waiting invocation that needs no user decision.
    /// Returns true when this left the tab with nothing pending.
    pub async fn auto_resolve(&self, store: &PlaygroundStore, tab_id: &str) -> bool {
        let Some(state) = store.tab_state(tab_id) else {
            return false;
        };
        let mut settled = false;
        for invocation in awaiting_invocations(&state.messages) {
            let id = invocation.tool_call_id.clone();
            let result = match self.toolbox.classification(&invocation) {
                None => {
                    if !self.claim(tab_id, &id) {
                        continue;
                    }
                    warn!("rejecting unrecognized tool {}", invocation.tool_name);
                    ToolResult::unrecognized(&invocation.tool_name)
                }
                Some(c) if c.kind == ToolKind::Read => {
                    if !self.claim(tab_id, &id) {
                        continue;
                    }
                    tokio::task::yield_now().await;
                    self.execute(&invocation).await
                }
                Some(_) => {
                    if !store.auto_execute_tools() || !self.claim(tab_id, &id) {
                        continue;
                    }
                    tokio::time::sleep(self.write_delay).await;
                    self.execute(&invocation).await
                }
            };
            if store.add_tool_result_to(tab_id, &id, result) == Resolution::Settled {
                settled = true;
            }
        }
        settled
    }

    async fn execute(&self, invocation: &ToolInvocation) -> ToolResult {
        let Some(classification) = self.toolbox.classification(invocation) else {
            return ToolResult::unrecognized(&invocation.tool_name);
        };
        debug!("{}", classification.running_text);
        let res = match classification.kind {
            ToolKind::Read => self.toolbox.execute_read(invocation).await,
            ToolKind::Write => self.toolbox.execute_write(invocation).await,
        };
        match res {
            Ok(result) => result,
            Err(e) => {
                warn!("{}: {e:#}", classification.error_text);
                ToolResult::failure(format!("{e:#}"))
            }
        }
    }
}
