//! Per-tab edits to catalogued tools.
//!
//! Overrides are keyed by provider id and the tool's catalog name, so a rename
//! never changes the key the override is stored under.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::McpTool;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolKey {
    pub provider_id: String,
    pub tool_name: String,
}

impl ToolKey {
    pub fn new(provider_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            tool_name: tool_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverride {
    /// Name exposed to the model instead of the qualified catalog name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Edits to top-level properties of the input schema, by property name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertyOverride>,
}

/// provider id -> catalog tool name -> override
pub type ToolOverrides = BTreeMap<String, BTreeMap<String, ToolOverride>>;

pub fn lookup<'a>(overrides: &'a ToolOverrides, key: &ToolKey) -> Option<&'a ToolOverride> {
    overrides.get(&key.provider_id)?.get(&key.tool_name)
}

impl ToolOverride {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn disable() -> Self {
        Self {
            disabled: true,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self == &ToolOverride::default()
    }

    /// Returns the tool as the model should see it, or `None` when disabled.
    ///
    /// The returned tool keeps its catalog name; callers decide how to expose a
    /// rename since the exposed name also has to stay resolvable.
    pub fn apply(&self, tool: &McpTool) -> Option<McpTool> {
        if self.disabled {
            return None;
        }
        let mut tool = tool.clone();
        if let Some(description) = &self.description {
            tool.description = Some(description.clone());
        }
        if !self.properties.is_empty() {
            apply_property_overrides(&mut tool.input_schema, &self.properties);
        }
        Some(tool)
    }
}

fn apply_property_overrides(schema: &mut Value, overrides: &BTreeMap<String, PropertyOverride>) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };
    let mut removed = vec![];
    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for (name, po) in overrides {
            if po.disabled {
                if props.remove(name).is_some() {
                    removed.push(name.clone());
                }
                continue;
            }
            if let (Some(description), Some(Value::Object(prop))) = (&po.description, props.get_mut(name)) {
                prop.insert("description".into(), Value::String(description.clone()));
            }
        }
    }
    if removed.is_empty() {
        return;
    }
    if let Some(Value::Array(required)) = obj.get_mut("required") {
        required.retain(|r| r.as_str().map(|s| !removed.iter().any(|n| n == s)).unwrap_or(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn search_tool() -> McpTool {
        McpTool {
            name: "search".into(),
            description: Some("Search things".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "number", "description": "max hits"}
                },
                "required": ["query", "limit"]
            }),
        }
    }

    #[test]
    fn disabled_tool_is_dropped() {
        assert!(ToolOverride::disable().apply(&search_tool()).is_none());
    }

    #[test]
    fn description_and_properties_are_rewritten() {
        let mut o = ToolOverride {
            description: Some("Find documents".into()),
            ..Default::default()
        };
        o.properties.insert(
            "query".into(),
            PropertyOverride {
                description: Some("full text query".into()),
                disabled: false,
            },
        );
        o.properties.insert(
            "limit".into(),
            PropertyOverride {
                description: None,
                disabled: true,
            },
        );

        let tool = o.apply(&search_tool()).unwrap();
        assert_eq!(tool.name, "search");
        assert_eq!(tool.description.as_deref(), Some("Find documents"));
        assert_eq!(
            tool.input_schema,
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "full text query"}
                },
                "required": ["query"]
            })
        );
    }

    #[test]
    fn lookup_by_provider_and_catalog_name() {
        let mut overrides = ToolOverrides::new();
        overrides
            .entry("docs".into())
            .or_default()
            .insert("search".into(), ToolOverride::rename("find"));
        let hit = lookup(&overrides, &ToolKey::new("docs", "search")).unwrap();
        assert_eq!(hit.name.as_deref(), Some("find"));
        assert!(lookup(&overrides, &ToolKey::new("other", "search")).is_none());
        assert!(ToolOverride::default().is_noop());
    }
}
