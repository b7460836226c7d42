//! Builds the list of tools offered to the model for one turn.
//!
//! Tools are exposed as `"{provider_id}--{tool_name}"` unless an override
//! renames them. The set remembers which provider/tool each exposed name came
//! from so tool calls can be routed back.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::mcp::McpTool;
use crate::tool_override::{ToolKey, ToolOverrides, lookup};

pub const NAME_SEPARATOR: &str = "--";

/// provider id -> tools it offers
pub type ToolCatalog = BTreeMap<String, Vec<McpTool>>;

pub fn qualified_name(provider_id: &str, tool_name: &str) -> String {
    format!("{provider_id}{NAME_SEPARATOR}{tool_name}")
}

pub fn split_qualified_name(name: &str) -> Option<ToolKey> {
    let (provider, tool) = name.split_once(NAME_SEPARATOR)?;
    if provider.is_empty() || tool.is_empty() {
        return None;
    }
    Some(ToolKey::new(provider, tool))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    specs: Vec<ToolSpec>,
    targets: HashMap<String, ToolKey>,
}

impl ToolSet {
    pub fn build(
        catalog: &ToolCatalog,
        enabled: &BTreeMap<String, Vec<String>>,
        overrides: &ToolOverrides,
    ) -> Self {
        let mut set = ToolSet::default();
        for (provider_id, names) in enabled {
            let Some(tools) = catalog.get(provider_id) else {
                debug!("provider {provider_id} has no catalog, skipping its tools");
                continue;
            };
            for name in names {
                let Some(tool) = tools.iter().find(|t| &t.name == name) else {
                    debug!("tool {provider_id}/{name} is enabled but not catalogued");
                    continue;
                };
                let key = ToolKey::new(provider_id.clone(), name.clone());
                let tool_override = lookup(overrides, &key);
                let (exposed, tool) = match tool_override {
                    Some(o) => {
                        let Some(t) = o.apply(tool) else { continue };
                        let exposed = o
                            .name
                            .clone()
                            .unwrap_or_else(|| qualified_name(provider_id, name));
                        (exposed, t)
                    }
                    None => (qualified_name(provider_id, name), tool.clone()),
                };
                if set.targets.contains_key(&exposed) {
                    warn!("duplicate tool name {exposed}, keeping the first one");
                    continue;
                }
                set.specs.push(ToolSpec {
                    name: exposed.clone(),
                    description: tool.description,
                    parameters: tool.input_schema,
                });
                set.targets.insert(exposed, key);
            }
        }
        set
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn resolve(&self, exposed_name: &str) -> Option<&ToolKey> {
        self.targets.get(exposed_name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_override::ToolOverride;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tool(name: &str) -> McpTool {
        McpTool {
            name: name.into(),
            description: Some(format!("{name} tool")),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    fn catalog() -> ToolCatalog {
        let mut c = ToolCatalog::new();
        c.insert("fetch".into(), vec![tool("fetch"), tool("fetch_raw_html")]);
        c.insert("pets".into(), vec![tool("list_pets"), tool("delete_pet")]);
        c
    }

    #[test]
    fn only_enabled_tools_are_exposed() {
        let mut enabled = BTreeMap::new();
        enabled.insert("fetch".to_string(), vec!["fetch".to_string()]);
        enabled.insert("pets".to_string(), vec!["list_pets".to_string(), "missing".to_string()]);
        let set = ToolSet::build(&catalog(), &enabled, &ToolOverrides::new());
        let names: Vec<_> = set.specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fetch--fetch", "pets--list_pets"]);
        assert_eq!(set.resolve("pets--list_pets"), Some(&ToolKey::new("pets", "list_pets")));
    }

    #[test]
    fn renamed_tools_resolve_to_catalog_name() {
        let mut enabled = BTreeMap::new();
        enabled.insert("pets".to_string(), vec!["list_pets".to_string(), "delete_pet".to_string()]);
        let mut overrides = ToolOverrides::new();
        let pets = overrides.entry("pets".into()).or_default();
        pets.insert("list_pets".into(), ToolOverride::rename("pets"));
        pets.insert("delete_pet".into(), ToolOverride::disable());

        let set = ToolSet::build(&catalog(), &enabled, &overrides);
        assert_eq!(set.len(), 1);
        assert_eq!(set.specs()[0].name, "pets");
        assert_eq!(set.resolve("pets"), Some(&ToolKey::new("pets", "list_pets")));
        assert!(set.resolve("pets--delete_pet").is_none());
    }

    #[test]
    fn qualified_names_split_on_first_separator() {
        assert_eq!(split_qualified_name("fetch--fetch_raw_html"), Some(ToolKey::new("fetch", "fetch_raw_html")));
        assert_eq!(split_qualified_name("a--b--c"), Some(ToolKey::new("a", "b--c")));
        assert_eq!(split_qualified_name("plain"), None);
    }
}
