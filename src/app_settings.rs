use serde::{Deserialize, Serialize};

use crate::mcp::ServerSpec;
use crate::tab::{DEFAULT_MAX_STEPS, MAX_HISTORY, TabState};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppSettings {
    pub id: Option<u32>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub default_credential: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub playground: PlaygroundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub provider: ProviderSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum ProviderSettings {
    OpenRouter {
        api_key: String,
        model: Option<String>,
    },
    Ollama {
        api_url: String,
        model: Option<String>,
    },
    /// Any other OpenAI-compatible endpoint.
    Custom {
        api_url: String,
        api_key: Option<String>,
        model: Option<String>,
    },
}

impl ProviderSettings {
    pub fn is_configured(&self) -> bool {
        match &self {
            ProviderSettings::OpenRouter { api_key, model } => !api_key.is_empty() && model.is_some(),
            ProviderSettings::Ollama { api_url, model } => !api_url.is_empty() && model.is_some(),
            ProviderSettings::Custom { api_url, model, .. } => !api_url.is_empty() && model.is_some(),
        }
    }

    pub fn get_api_url(&self) -> String {
        match &self {
            ProviderSettings::OpenRouter { .. } => "https://openrouter.ai/api/v1".to_string(),
            ProviderSettings::Ollama { api_url, .. } => api_url.clone(),
            ProviderSettings::Custom { api_url, .. } => api_url.clone(),
        }
    }

    pub fn get_api_key(&self) -> Option<String> {
        match &self {
            ProviderSettings::OpenRouter { api_key, .. } => Some(api_key.clone()),
            ProviderSettings::Ollama { .. } => None,
            ProviderSettings::Custom { api_key, .. } => api_key.clone(),
        }
    }

    pub fn get_model(&self) -> Option<String> {
        match &self {
            ProviderSettings::OpenRouter { model, .. } => model.clone(),
            ProviderSettings::Ollama { model, .. } => model.clone(),
            ProviderSettings::Custom { model, .. } => model.clone(),
        }
    }
}

fn default_max_steps() -> u32 {
    DEFAULT_MAX_STEPS
}

fn default_max_history() -> usize {
    MAX_HISTORY
}

fn default_auto_approve_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaygroundConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Pause before an auto-approved write tool runs.
    #[serde(default = "default_auto_approve_delay_ms")]
    pub auto_approve_delay_ms: u64,
    #[serde(default)]
    pub default_system_prompt: String,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_history: default_max_history(),
            auto_approve_delay_ms: default_auto_approve_delay_ms(),
            default_system_prompt: String::new(),
        }
    }
}

pub const ENV_CREDENTIAL_ID: &str = "env";

impl AppSettings {
    pub fn credential(&self, id: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.id == id)
    }

    /// The default credential, falling back to the first configured one.
    pub fn default_credential(&self) -> Option<&Credential> {
        self.default_credential
            .as_deref()
            .and_then(|id| self.credential(id))
            .or_else(|| self.credentials.first())
    }

    /// State new tabs start from.
    pub fn tab_defaults(&self) -> TabState {
        let credential = self.default_credential();
        TabState {
            credential_id: credential.map(|c| c.id.clone()),
            model: credential.and_then(|c| c.provider.get_model()).unwrap_or_default(),
            system_prompt: self.playground.default_system_prompt.clone(),
            max_steps: self.playground.max_steps,
            ..Default::default()
        }
    }

    /// Applies `PLAYGROUND_API_URL`, `PLAYGROUND_API_KEY` and `PLAYGROUND_MODEL`
    /// as a credential named `env`, made the default.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("PLAYGROUND_API_URL").ok(),
            std::env::var("PLAYGROUND_API_KEY").ok(),
            std::env::var("PLAYGROUND_MODEL").ok(),
        );
    }

    fn apply_overrides(&mut self, api_url: Option<String>, api_key: Option<String>, model: Option<String>) {
        let Some(api_url) = api_url.filter(|u| !u.is_empty()) else {
            return;
        };
        self.credentials.retain(|c| c.id != ENV_CREDENTIAL_ID);
        self.credentials.push(Credential {
            id: ENV_CREDENTIAL_ID.into(),
            name: "Environment".into(),
            provider: ProviderSettings::Custom { api_url, api_key, model },
        });
        self.default_credential = Some(ENV_CREDENTIAL_ID.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn settings_parse_with_defaults() {
        let s: AppSettings = serde_json::from_str(
            r#"{
                "id": 1,
                "credentials": [{"id": "or", "name": "OpenRouter", "provider": {"id": "openrouter", "api_key": "k", "model": "m"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(s.playground, PlaygroundConfig::default());
        let c = s.default_credential().unwrap();
        assert!(c.provider.is_configured());
        assert_eq!(c.provider.get_api_url(), "https://openrouter.ai/api/v1");
        assert_eq!(s.tab_defaults().model, "m");
        assert_eq!(s.tab_defaults().credential_id.as_deref(), Some("or"));
    }

    #[test]
    fn env_overrides_become_default_credential() {
        let mut s = AppSettings::default();
        s.apply_overrides(Some("http://localhost:11434/v1".into()), None, Some("q3c".into()));
        s.apply_overrides(Some("http://localhost:8080/v1".into()), None, Some("q3c".into()));
        assert_eq!(s.credentials.len(), 1);
        let c = s.default_credential().unwrap();
        assert_eq!(c.id, ENV_CREDENTIAL_ID);
        assert_eq!(c.provider.get_api_url(), "http://localhost:8080/v1");

        s.apply_overrides(None, Some("k".into()), None);
        assert_eq!(s.credentials.len(), 1);
    }
}
