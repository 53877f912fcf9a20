//! # Helion Gateway
//!
//! Turns prompts into vetted generation results.
//!
//! The gateway owns everything between "the user typed a sentence" and "the
//! analyzer has code to look at": provider adapters behind the
//! [`LlmProvider`] trait, the [`ResourceMonitor`] that tiers available
//! models, the [`PromptRouter`] that classifies requests, and the
//! [`Gateway`] pipeline that sanitizes, scores, selects, invokes, falls
//! back, and post-processes.
//!
//! Token discipline is the design driver: the confidence gate runs before
//! any provider call, routing prefers the smallest adequate model, and
//! provider failure gets exactly one automatic fallback before the error
//! surfaces.

pub mod gateway;
pub mod hints;
pub mod monitor;
pub mod prompts;
pub mod provider;
pub mod providers;
pub mod router;

pub use gateway::{
    extract_capabilities, postprocess_html, ClarificationRequest, Gateway, GatewayConfig,
    GatewayError, GenerateRequestOpts, GenerationOutcome, GenerationResult,
    ProcessGenerationResult,
};
pub use monitor::{ModelInfo, ResourceMonitor, TaskClass};
pub use provider::{ChatMessage, GenerateOpts, LlmProvider, ProviderError, ProviderRegistry, Role};
pub use providers::{
    ClaudeConfig, ClaudeProvider, OllamaConfig, OllamaProvider, OpenAiConfig, OpenAiProvider,
};
pub use router::{Classification, PromptRouter};
