//! Local inference via an Ollama-compatible endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::PROBE_TIMEOUT;
use crate::provider::{ChatMessage, GenerateOpts, LlmProvider, ProviderError};

/// Ollama endpoint configuration.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL, e.g. `http://127.0.0.1:11434`.
    pub url: String,
    /// Default model name.
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434".into(),
            model: "qwen2.5-coder:7b".into(),
        }
    }
}

/// The local-inference adapter.
pub struct OllamaProvider {
    config: OllamaConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OllamaProvider {
    /// Build the adapter.
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Model names with their reported sizes, for tier estimation.
    pub async fn list_models_sized(&self) -> Result<Vec<(String, u64)>, ProviderError> {
        let url = format!("{}/api/tags", self.config.url);
        let resp: TagsResponse = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ProviderError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        Ok(resp.models.into_iter().map(|m| (m.name, m.size)).collect())
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn default_model(&self) -> String {
        self.config.model.clone()
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.url);
        matches!(
            self.client.get(&url).timeout(PROBE_TIMEOUT).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .list_models_sized()
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        opts: &GenerateOpts,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": model.unwrap_or(&self.config.model),
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": opts.temperature,
                "num_predict": opts.max_tokens,
            },
        });
        let url = format!("{}/api/chat", self.config.url);
        let resp: ChatResponse = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| ProviderError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        Ok(resp.message.content)
    }
}
