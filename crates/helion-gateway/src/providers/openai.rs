//! OpenAI-compatible chat-completions adapter.
//!
//! `base_url` is configurable so the same adapter serves any endpoint that
//! speaks the chat-completions dialect.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::PROBE_TIMEOUT;
use crate::provider::{ChatMessage, GenerateOpts, LlmProvider, ProviderError};

/// OpenAI-compatible endpoint configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key; the adapter reports unavailable when empty.
    pub api_key: String,
    /// Base URL without the path, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Default model.
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
        }
    }
}

/// The OpenAI-compatible adapter.
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

impl OpenAiProvider {
    /// Build the adapter.
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> String {
        self.config.model.clone()
    }

    async fn is_available(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::Unavailable("no api key".into()));
        }
        let url = format!("{}/models", self.config.base_url);
        let resp: ModelsResponse = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ProviderError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        Ok(resp.data.into_iter().map(|m| m.id).collect())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        opts: &GenerateOpts,
    ) -> Result<String, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::Unavailable("no api key".into()));
        }
        let body = json!({
            "model": model.unwrap_or(&self.config.model),
            "messages": messages,
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
        });
        let url = format!("{}/chat/completions", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http(format!("{status}: {text}")));
        }

        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::BadResponse("empty completion".into()))
    }
}
