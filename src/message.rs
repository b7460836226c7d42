//! Conversation messages as the playground stores them.
//!
//! A message is an ordered list of parts. Tool calls requested by the model are
//! stored as tool-invocation parts and move through
//! `PartialCall -> Call -> Result`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tool_override::ToolKey;
use crate::toolbox::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Data,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Data => "data",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationState {
    /// Proposed by the model, arguments not final yet.
    PartialCall,
    /// Arguments final, waiting for approval or execution.
    Call,
    /// Executed (or rejected); `result` is set.
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    /// Name the model used for the call.
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    pub state: InvocationState,
    /// Provider and catalog name the exposed name resolved to when the call was
    /// recorded. Missing for names the tool set did not know.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ToolKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl ToolInvocation {
    pub fn call(tool_call_id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            args,
            state: InvocationState::Call,
            target: None,
            result: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, InvocationState::PartialCall | InvocationState::Call)
    }

    pub fn resolve(&mut self, result: ToolResult) {
        self.state = InvocationState::Result;
        self.result = Some(result);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        reasoning: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: String::new(),
            role,
            parts,
            attachments: vec![],
        }
    }

    pub fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Part::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    /// An assistant message holding a single tool-invocation part.
    pub fn tool_invocation(invocation: ToolInvocation) -> Self {
        Self::new(
            Role::Assistant,
            vec![Part::ToolInvocation {
                tool_invocation: invocation,
            }],
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = new_message_id();
        }
    }

    /// All text parts joined with newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            Part::Reasoning { reasoning } => Some(reasoning.as_str()),
            _ => None,
        })
    }

    /// Replaces the first text part, adding one if the message has none.
    pub fn set_text(&mut self, new_text: impl Into<String>) {
        let new_text = new_text.into();
        for part in self.parts.iter_mut() {
            if let Part::Text { text } = part {
                *text = new_text;
                return;
            }
        }
        self.parts.push(Part::Text { text: new_text });
    }

    /// Appends to the reasoning part. Reasoning is kept ahead of the text.
    pub fn append_reasoning(&mut self, delta: &str) {
        for part in self.parts.iter_mut() {
            if let Part::Reasoning { reasoning } = part {
                reasoning.push_str(delta);
                return;
            }
        }
        self.parts.insert(
            0,
            Part::Reasoning {
                reasoning: delta.to_string(),
            },
        );
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolInvocation { tool_invocation } => Some(tool_invocation),
            _ => None,
        })
    }

    pub fn tool_invocation_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts.iter_mut().find_map(|p| match p {
            Part::ToolInvocation { tool_invocation } if tool_invocation.tool_call_id == tool_call_id => {
                Some(tool_invocation)
            }
            _ => None,
        })
    }

    pub fn has_pending_invocation(&self) -> bool {
        self.tool_invocations().any(|t| t.is_pending())
    }
}

pub fn has_pending_invocations(messages: &[Message]) -> bool {
    messages.iter().any(|m| m.has_pending_invocation())
}

pub fn find_invocation<'a>(messages: &'a [Message], tool_call_id: &str) -> Option<&'a ToolInvocation> {
    messages
        .iter()
        .flat_map(|m| m.tool_invocations())
        .find(|t| t.tool_call_id == tool_call_id)
}

/// Pending invocations in `call` state, oldest first.
pub fn awaiting_invocations(messages: &[Message]) -> Vec<ToolInvocation> {
    messages
        .iter()
        .flat_map(|m| m.tool_invocations())
        .filter(|t| t.state == InvocationState::Call)
        .cloned()
        .collect()
}
