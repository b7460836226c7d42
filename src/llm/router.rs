use anyhow::anyhow;
use tracing::debug;

use crate::app_settings::{AppSettings, Credential};
use crate::llm::{CompletionProvider, CompletionRequest, EventStream, LlmClient};

/// Sends each request to the endpoint of the credential the tab names.
pub struct ProviderRouter {
    credentials: Vec<Credential>,
    default_credential: Option<String>,
}

impl ProviderRouter {
    pub fn new(credentials: Vec<Credential>, default_credential: Option<String>) -> Self {
        Self {
            credentials,
            default_credential,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        Self::new(
            settings.credentials.clone(),
            settings.default_credential().map(|c| c.id.clone()),
        )
    }

    fn credential(&self, id: Option<&str>) -> anyhow::Result<&Credential> {
        let id = id.or(self.default_credential.as_deref());
        let found = match id {
            Some(id) => self.credentials.iter().find(|c| c.id == id),
            None => self.credentials.first(),
        };
        found.ok_or_else(|| match id {
            Some(id) => anyhow!("unknown credential {id}"),
            None => anyhow!("no credentials configured"),
        })
    }

    pub fn client_for(&self, credential_id: Option<&str>) -> anyhow::Result<LlmClient> {
        let c = self.credential(credential_id)?;
        Ok(LlmClient::new(c.provider.get_api_url(), c.provider.get_api_key()))
    }
}

#[async_trait::async_trait]
impl CompletionProvider for ProviderRouter {
    async fn stream(&self, mut request: CompletionRequest) -> anyhow::Result<EventStream> {
        let credential = self.credential(request.credential_id.as_deref())?;
        if request.model.is_empty() {
            request.model = credential
                .provider
                .get_model()
                .ok_or_else(|| anyhow!("no model selected for credential {}", credential.id))?;
        }
        debug!("routing request for {} through credential {}", request.model, credential.id);
        let client = LlmClient::new(credential.provider.get_api_url(), credential.provider.get_api_key());
        client.stream(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_settings::ProviderSettings;

    fn router() -> ProviderRouter {
        ProviderRouter::new(
            vec![
                Credential {
                    id: "local".into(),
                    name: "Ollama".into(),
                    provider: ProviderSettings::Ollama {
                        api_url: "http://localhost:11434/v1".into(),
                        model: Some("q3c".into()),
                    },
                },
                Credential {
                    id: "or".into(),
                    name: "OpenRouter".into(),
                    provider: ProviderSettings::OpenRouter {
                        api_key: "k".into(),
                        model: None,
                    },
                },
            ],
            Some("local".into()),
        )
    }

    #[test]
    fn credential_lookup_falls_back_to_default() {
        let r = router();
        assert_eq!(r.credential(None).unwrap().id, "local");
        assert_eq!(r.credential(Some("or")).unwrap().id, "or");
        assert!(r.credential(Some("missing")).is_err());
        assert!(ProviderRouter::new(vec![], None).credential(None).is_err());
    }
}
