//! Anthropic Messages API adapter.
//!
//! The Messages API takes the system prompt as a top-level field, not a
//! message; the adapter splits the sequence accordingly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::provider::{ChatMessage, GenerateOpts, LlmProvider, ProviderError, Role};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic configuration.
#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    /// API key; the adapter reports unavailable when empty.
    pub api_key: String,
    /// Default model.
    pub model: String,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".into(),
        }
    }
}

/// The Anthropic adapter.
pub struct ClaudeProvider {
    config: ClaudeConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl ClaudeProvider {
    /// Build the adapter.
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Models this adapter will claim to serve. The API has no cheap listing
    /// endpoint worth probing, so this is the static family table.
    fn known_models() -> Vec<String> {
        vec![
            "claude-opus-4-1-20250805".into(),
            "claude-sonnet-4-20250514".into(),
            "claude-3-5-haiku-20241022".into(),
        ]
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
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
        Ok(Self::known_models())
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

        let system: String = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let turns: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => unreachable!("filtered above"),
                    },
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": model.unwrap_or(&self.config.model),
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        let resp = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http(format!("{status}: {text}")));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        let text: String = parsed.content.into_iter().map(|b| b.text).collect();
        if text.is_empty() {
            return Err(ProviderError::BadResponse("empty completion".into()));
        }
        Ok(text)
    }
}
