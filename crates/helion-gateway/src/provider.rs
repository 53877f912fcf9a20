//! The provider abstraction.
//!
//! A provider accepts a message sequence and returns a text completion.
//! Everything provider-specific — single-prompt vs. messages encodings,
//! header authentication, base URLs — stays inside the adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Message roles in a chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions from the kernel.
    System,
    /// The user's prompt.
    User,
    /// A prior model turn.
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who said it.
    pub role: Role,
    /// What they said.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Per-call generation knobs.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOpts {
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum output tokens.
    pub max_tokens: u32,
}

impl Default for GenerateOpts {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 8192,
        }
    }
}

/// Provider failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is not configured or not reachable.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// Transport-level failure.
    #[error("http error: {0}")]
    Http(String),
    /// The provider answered with something we could not use.
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Http(err.to_string())
    }
}

/// A pluggable LLM provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name (`ollama`, `claude`, `openai`).
    fn name(&self) -> &str;

    /// The model used when a call does not override it.
    fn default_model(&self) -> String;

    /// Cheap availability check (configuration plus, where meaningful, a
    /// probe with a short deadline).
    async fn is_available(&self) -> bool;

    /// Models this provider can serve. Used by the resource monitor.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    /// Run a completion over the message sequence.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        opts: &GenerateOpts,
    ) -> Result<String, ProviderError>;
}

/// Name → adapter map. The registry owns trait objects; callers pick by
/// name or iterate in registration order for fallback.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<(String, Arc<dyn LlmProvider>)>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Later registrations with the same name replace
    /// earlier ones.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let name = provider.name().to_string();
        self.providers.retain(|(n, _)| n != &name);
        self.providers.push((name, provider));
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| Arc::clone(p))
    }

    /// All adapters in registration order.
    pub fn all(&self) -> Vec<Arc<dyn LlmProvider>> {
        self.providers.iter().map(|(_, p)| Arc::clone(p)).collect()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Availability of every adapter, probed concurrently.
    pub async fn availability(&self) -> HashMap<String, bool> {
        let mut out = HashMap::new();
        for (name, provider) in &self.providers {
            out.insert(name.clone(), provider.is_available().await);
        }
        out
    }
}
