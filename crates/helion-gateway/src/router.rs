//! Prompt router: iframe or process, and how hard.
//!
//! When a router model is available the classification is LLM-backed with a
//! strict JSON-only contract and an 8 s deadline. The router's verdict is
//! authoritative only for `type` and `complexity`; template and model
//! suggestions are dropped unless the kernel recognizes them. When no router
//! model exists (or the call fails), keyword classification takes over, and
//! the result says so via `source`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use helion_guard::{confidence, infer_app_type, AppType, Complexity};

use crate::monitor::{ResourceMonitor, TaskClass};
use crate::prompts::ROUTER_SYSTEM_PROMPT;
use crate::provider::{ChatMessage, GenerateOpts, ProviderRegistry};

/// Router call deadline.
pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(8);

/// A classification result.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    /// iframe or process. (Wasm apps are launched explicitly, not routed.)
    pub app_type: AppType,
    /// Prompt complexity.
    pub complexity: Complexity,
    /// Display title suggestion.
    pub title: String,
    /// `llm` or `regex`.
    pub source: &'static str,
}

#[derive(Deserialize)]
struct RouterVerdict {
    #[serde(rename = "type")]
    app_type: Option<String>,
    complexity: Option<String>,
    title: Option<String>,
}

/// The router.
pub struct PromptRouter {
    providers: ProviderRegistry,
}

impl PromptRouter {
    /// Build over the provider registry.
    pub fn new(providers: ProviderRegistry) -> Self {
        Self { providers }
    }

    /// Classify a prompt, preferring the LLM router when one is available.
    pub async fn route(&self, prompt: &str, monitor: &ResourceMonitor) -> Classification {
        if let Some(router_model) = monitor.best_for(TaskClass::Route) {
            if let Some(provider) = self.providers.get(&router_model.provider) {
                let messages = [
                    ChatMessage::system(ROUTER_SYSTEM_PROMPT),
                    ChatMessage::user(prompt),
                ];
                let opts = GenerateOpts {
                    temperature: 0.0,
                    max_tokens: 256,
                };
                let call = provider.generate(&messages, Some(&router_model.name), &opts);
                match tokio::time::timeout(ROUTE_TIMEOUT, call).await {
                    Ok(Ok(text)) => {
                        if let Some(parsed) = parse_verdict(&text, prompt) {
                            return parsed;
                        }
                        tracing::debug!("router output unparseable, falling back to keywords");
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(%err, "router call failed, falling back to keywords");
                    }
                    Err(_) => {
                        tracing::debug!("router call timed out, falling back to keywords");
                    }
                }
            }
        }
        Self::fallback(prompt)
    }

    /// Pure keyword classification.
    pub fn fallback(prompt: &str) -> Classification {
        Classification {
            app_type: infer_app_type(prompt),
            complexity: confidence::complexity(prompt),
            title: default_title(prompt),
            source: "regex",
        }
    }
}

/// Parse the router's JSON, tolerating fences and surrounding prose.
fn parse_verdict(text: &str, prompt: &str) -> Option<Classification> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let verdict: RouterVerdict = serde_json::from_str(&text[start..=end]).ok()?;

    let app_type = match verdict.app_type.as_deref() {
        Some("iframe") => AppType::Iframe,
        Some("process") => AppType::Process,
        _ => return None,
    };
    let complexity = match verdict.complexity.as_deref() {
        Some("simple") => Complexity::Simple,
        Some("medium") => Complexity::Medium,
        Some("complex") => Complexity::Complex,
        _ => return None,
    };
    let title = verdict
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| default_title(prompt));

    Some(Classification {
        app_type,
        complexity,
        title,
        source: "llm",
    })
}

/// Title-case the first few meaningful words of the prompt.
pub fn default_title(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(4).collect();
    let raw = if words.is_empty() {
        "Untitled App".to_string()
    } else {
        words.join(" ")
    };
    raw.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
