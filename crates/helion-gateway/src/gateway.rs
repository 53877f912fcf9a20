//! The generation pipeline.
//!
//! Order matters and is fixed: hint extraction → sanitization → confidence
//! gate → complexity → provider selection → memory lookup → provider call
//! (with one automatic fallback) → post-processing → capability extraction
//! → knowledge recording. The confidence gate sits *before* any provider
//! call so vague prompts cost zero tokens.

use std::sync::Arc;
use thiserror::Error;

use helion_guard::{confidence, Capability, Complexity, ConfidenceReport, Sanitizer};
use helion_kernel::{KernelError, KnowledgeBase, KnowledgeEntry};

use crate::hints::{self, ModelHint};
use crate::monitor::ResourceMonitor;
use crate::prompts;
use crate::provider::{ChatMessage, GenerateOpts, LlmProvider, ProviderRegistry};
use crate::router::default_title;

/// Gateway failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No configured provider can serve the request.
    #[error("no provider available")]
    NoProviderAvailable,
    /// The provider (and the fallback, if any) failed.
    #[error("provider '{provider}' failed: {message}")]
    ProviderFailed {
        /// The last provider tried.
        provider: String,
        /// Its error text.
        message: String,
    },
    /// Process generation output was missing a section marker.
    #[error("malformed process output: missing {missing} marker")]
    MalformedProcessOutput {
        /// Which marker was absent.
        missing: &'static str,
    },
}

impl GatewayError {
    /// Stable kind string for API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NoProviderAvailable => "no_provider_available",
            GatewayError::ProviderFailed { .. } => "provider_failed",
            GatewayError::MalformedProcessOutput { .. } => "malformed_process_output",
        }
    }
}

impl From<GatewayError> for KernelError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NoProviderAvailable => KernelError::ProviderUnavailable { reason: None },
            GatewayError::ProviderFailed { provider, message } => {
                KernelError::ProviderFailed { provider, message }
            }
            GatewayError::MalformedProcessOutput { missing } => KernelError::ProviderFailed {
                provider: "unknown".into(),
                message: format!("malformed process output: missing {missing} marker"),
            },
        }
    }
}

/// Gateway policy knobs.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Pin every generation to this provider.
    pub provider_override: Option<String>,
    /// Provider tried when the selected one fails.
    pub fallback_provider: Option<String>,
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateRequestOpts {
    /// Skip the confidence gate.
    pub force: bool,
}

/// A successful iframe generation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationResult {
    /// The generated HTML.
    pub code: String,
    /// Display title.
    pub title: String,
    /// The sanitized prompt that was actually sent.
    pub prompt: String,
    /// Provider that served it.
    pub provider: String,
    /// Model that served it.
    pub model: String,
    /// Classified complexity.
    pub complexity: Complexity,
    /// Capabilities the code declared (first-line comment).
    pub capabilities: Vec<Capability>,
    /// The confidence breakdown.
    pub confidence: ConfidenceReport,
    /// Sanitizer patterns that fired.
    pub sanitizer_flags: Vec<&'static str>,
    /// The model hint, when one was given.
    pub model_hint: Option<String>,
}

/// Returned instead of a result when confidence is too low.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClarificationRequest {
    /// Up to three questions for the user.
    pub questions: Vec<String>,
    /// The score that triggered the gate.
    pub confidence: ConfidenceReport,
}

/// A successful process generation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessGenerationResult {
    /// The container recipe.
    pub dockerfile: String,
    /// The application code.
    pub code: String,
    /// Capabilities the recipe declared.
    pub capabilities: Vec<Capability>,
    /// Provider that served it.
    pub provider: String,
    /// Model that served it.
    pub model: String,
    /// Sanitizer patterns that fired.
    pub sanitizer_flags: Vec<&'static str>,
}

/// Either a generation or a request for more detail.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationOutcome {
    /// Generation succeeded.
    Generated(GenerationResult),
    /// The prompt needs clarification first.
    NeedsClarification(ClarificationRequest),
}

/// The generation gateway.
pub struct Gateway {
    providers: ProviderRegistry,
    monitor: Arc<ResourceMonitor>,
    knowledge: Arc<KnowledgeBase>,
    sanitizer: Sanitizer,
    config: GatewayConfig,
}

/// What provider selection settled on.
struct Selection {
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
}

impl Gateway {
    /// Build the gateway.
    pub fn new(
        providers: ProviderRegistry,
        monitor: Arc<ResourceMonitor>,
        knowledge: Arc<KnowledgeBase>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            providers,
            monitor,
            knowledge,
            sanitizer: Sanitizer::new(),
            config,
        }
    }

    /// Generate an iframe app from a prompt.
    pub async fn generate(
        &self,
        prompt: &str,
        opts: GenerateRequestOpts,
    ) -> Result<GenerationOutcome, GatewayError> {
        // 1. Model hint, stripped before anything else sees the prompt.
        let (prompt, hint) = hints::extract(prompt);

        // 2. Sanitize. Flags never fail the request.
        let sanitized = self.sanitizer.sanitize(&prompt);
        if !sanitized.is_clean() {
            tracing::warn!(flags = ?sanitized.flags, "prompt sanitizer fired");
        }

        // 3. Confidence gate — before any provider call.
        let confidence_report = confidence::score(&sanitized.text);
        if !confidence_report.is_confident() && !opts.force {
            let questions =
                confidence::clarification_questions(&confidence_report, &sanitized.text);
            return Ok(GenerationOutcome::NeedsClarification(ClarificationRequest {
                questions,
                confidence: confidence_report,
            }));
        }

        // 4. Complexity.
        let complexity = confidence::complexity(&sanitized.text);

        // 5. Provider selection.
        let selection = self.select_provider(hint.as_ref(), complexity).await?;

        // 6. Memory: similar past generations, threshold 0.25, at most 3.
        let memory = self.knowledge.find_similar(&sanitized.text, 0.25, 3);

        // 7–8. Invoke with one automatic fallback.
        let mut system = prompts::iframe_system_prompt();
        if let Some(section) = prompts::memory_section(&memory) {
            system.push_str("\n\n");
            system.push_str(&section);
        }
        let messages = [
            ChatMessage::system(system),
            ChatMessage::user(sanitized.text.clone()),
        ];
        let (raw, provider_name, model_name) = self.invoke(&selection, &messages).await?;

        // 9. Post-process.
        let code = postprocess_html(&raw);

        // 10. Declared capabilities.
        let capabilities = extract_capabilities(&code, "<!--");

        // 11. Remember.
        let entry = KnowledgeEntry {
            prompt: sanitized.text.clone(),
            normalized: String::new(),
            provider: provider_name.clone(),
            model: model_name.clone(),
            complexity,
            capabilities: capabilities.clone(),
            created_at: now_unix(),
        };
        if let Err(err) = self.knowledge.record(entry) {
            tracing::warn!(%err, "knowledge record failed");
        }

        Ok(GenerationOutcome::Generated(GenerationResult {
            code,
            title: default_title(&sanitized.text),
            prompt: sanitized.text,
            provider: provider_name,
            model: model_name,
            complexity,
            capabilities,
            confidence: confidence_report,
            sanitizer_flags: sanitized.flags,
            model_hint: hint.map(|h| h.alias),
        }))
    }

    /// Generate a process app: recipe plus code, marker-delimited.
    pub async fn generate_process(
        &self,
        prompt: &str,
    ) -> Result<ProcessGenerationResult, GatewayError> {
        let (prompt, hint) = hints::extract(prompt);
        let sanitized = self.sanitizer.sanitize(&prompt);

        // Process apps always count as complex for selection purposes.
        let selection = self
            .select_provider(hint.as_ref(), Complexity::Complex)
            .await?;

        let messages = [
            ChatMessage::system(prompts::process_system_prompt()),
            ChatMessage::user(sanitized.text.clone()),
        ];
        let (raw, provider_name, model_name) = self.invoke(&selection, &messages).await?;

        let (dockerfile, code) = parse_process_sections(&raw)?;
        let capabilities = extract_capabilities(&dockerfile, "#");

        Ok(ProcessGenerationResult {
            dockerfile,
            code,
            capabilities,
            provider: provider_name,
            model: model_name,
            sanitizer_flags: sanitized.flags,
        })
    }

    /// Raw completion for background tasks (spec writing, queue work).
    ///
    /// Runs provider selection and the single-fallback policy but none of
    /// the app-generation post-processing.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        complexity: Complexity,
    ) -> Result<(String, String, String), GatewayError> {
        let selection = self.select_provider(None, complexity).await?;
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        self.invoke(&selection, &messages).await
    }

    /// Selection chain: user hint > config override > monitor > static.
    async fn select_provider(
        &self,
        hint: Option<&ModelHint>,
        complexity: Complexity,
    ) -> Result<Selection, GatewayError> {
        if let Some(hint) = hint {
            if let Some(provider) = self.providers.get(hint.provider) {
                if provider.is_available().await {
                    return Ok(Selection {
                        provider,
                        model: hint.model.map(String::from),
                    });
                }
                tracing::warn!(hinted = hint.provider, "hinted provider unavailable");
            }
        }

        if let Some(name) = &self.config.provider_override {
            if let Some(provider) = self.providers.get(name) {
                if provider.is_available().await {
                    return Ok(Selection {
                        provider,
                        model: None,
                    });
                }
            }
        }

        if let Some(model) = self.monitor.best_for(complexity.into()) {
            if let Some(provider) = self.providers.get(&model.provider) {
                if provider.is_available().await {
                    return Ok(Selection {
                        provider,
                        model: Some(model.name),
                    });
                }
            }
        }

        // Static fallback: complex work prefers the cloud when a key exists.
        let preference: &[&str] = match complexity {
            Complexity::Complex => &["claude", "openai", "ollama"],
            _ => &["ollama", "claude", "openai"],
        };
        for name in preference {
            if let Some(provider) = self.providers.get(name) {
                if provider.is_available().await {
                    return Ok(Selection {
                        provider,
                        model: None,
                    });
                }
            }
        }
        for provider in self.providers.all() {
            if provider.is_available().await {
                return Ok(Selection {
                    provider,
                    model: None,
                });
            }
        }
        Err(GatewayError::NoProviderAvailable)
    }

    /// Call the selected provider; on failure, try exactly one fallback
    /// (configured fallback, else any other available provider).
    async fn invoke(
        &self,
        selection: &Selection,
        messages: &[ChatMessage],
    ) -> Result<(String, String, String), GatewayError> {
        let opts = GenerateOpts::default();
        let model = selection.model.as_deref();
        let primary = selection.provider.name().to_string();
        let primary_model = selection
            .model
            .clone()
            .unwrap_or_else(|| selection.provider.default_model());

        match selection.provider.generate(messages, model, &opts).await {
            Ok(text) => return Ok((text, primary, primary_model)),
            Err(err) => {
                tracing::warn!(provider = %primary, %err, "generation failed, trying fallback");
                let fallback = self.fallback_provider(&primary).await;
                let Some(fallback) = fallback else {
                    return Err(GatewayError::ProviderFailed {
                        provider: primary,
                        message: err.to_string(),
                    });
                };
                let fb_name = fallback.name().to_string();
                match fallback.generate(messages, None, &opts).await {
                    Ok(text) => {
                        let fb_model = fallback.default_model();
                        Ok((text, fb_name, fb_model))
                    }
                    Err(fb_err) => Err(GatewayError::ProviderFailed {
                        provider: fb_name,
                        message: fb_err.to_string(),
                    }),
                }
            }
        }
    }

    async fn fallback_provider(&self, exclude: &str) -> Option<Arc<dyn LlmProvider>> {
        if let Some(name) = &self.config.fallback_provider {
            if name != exclude {
                if let Some(provider) = self.providers.get(name) {
                    if provider.is_available().await {
                        return Some(provider);
                    }
                }
            }
        }
        for provider in self.providers.all() {
            if provider.name() != exclude && provider.is_available().await {
                return Some(provider);
            }
        }
        None
    }
}

/// Strip markdown fences, then truncate to the first document start
/// (`<!DOCTYPE`, `<html`, or a leading comment).
pub fn postprocess_html(raw: &str) -> String {
    let mut text = raw.trim();

    // Fenced block: take the fence body.
    if let Some(rest) = text.strip_prefix("```") {
        let rest = match rest.split_once('\n') {
            Some((lang, body)) if lang.trim().len() <= 10 => body,
            _ => rest,
        };
        text = rest.strip_suffix("```").unwrap_or(rest).trim();
    }

    // Truncate any prose before the document. Offsets come from an ASCII
    // lowercase copy, so guard the boundary for exotic inputs.
    let lower = text.to_ascii_lowercase();
    let starts = ["<!doctype", "<html", "<!--"];
    if let Some(pos) = starts.iter().filter_map(|s| lower.find(s)).min() {
        if text.is_char_boundary(pos) {
            text = &text[pos..];
        }
    }
    text.to_string()
}

/// Parse `---DOCKERFILE---` / `---CODE---` / `---END---` sections.
fn parse_process_sections(raw: &str) -> Result<(String, String), GatewayError> {
    const DOCKERFILE: &str = "---DOCKERFILE---";
    const CODE: &str = "---CODE---";
    const END: &str = "---END---";

    let df_start = raw
        .find(DOCKERFILE)
        .ok_or(GatewayError::MalformedProcessOutput {
            missing: DOCKERFILE,
        })?;
    let code_start = raw.find(CODE).ok_or(GatewayError::MalformedProcessOutput {
        missing: CODE,
    })?;
    let end = raw.find(END).ok_or(GatewayError::MalformedProcessOutput {
        missing: END,
    })?;
    if !(df_start < code_start && code_start < end) {
        return Err(GatewayError::MalformedProcessOutput { missing: CODE });
    }

    let dockerfile = raw[df_start + DOCKERFILE.len()..code_start].trim().to_string();
    let code = raw[code_start + CODE.len()..end].trim().to_string();
    Ok((dockerfile, code))
}

/// Parse the first-line capability comment. Unknown names are dropped;
/// an absent or empty declaration defaults to `ui:window`.
pub fn extract_capabilities(code: &str, comment_lead: &str) -> Vec<Capability> {
    let first_line = code.lines().next().unwrap_or_default();
    let mut caps = Vec::new();
    if first_line.trim_start().starts_with(comment_lead) {
        if let Some(idx) = first_line.to_ascii_lowercase().find("capabilities:") {
            let rest = &first_line[idx + "capabilities:".len()..];
            let rest = rest.trim_end_matches("-->").trim();
            for word in rest.split([' ', ',']) {
                let word = word.trim();
                if word.is_empty() {
                    continue;
                }
                if let Ok(cap) = word.parse::<Capability>() {
                    if !caps.contains(&cap) {
                        caps.push(cap);
                    }
                }
            }
        }
    }
    if caps.is_empty() {
        caps.push(Capability::UiWindow);
    }
    caps
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
