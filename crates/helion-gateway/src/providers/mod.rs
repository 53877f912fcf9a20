//! Provider adapters.

mod claude;
mod ollama;
mod openai;

pub use claude::{ClaudeConfig, ClaudeProvider};
pub use ollama::{OllamaConfig, OllamaProvider};
pub use openai::{OpenAiConfig, OpenAiProvider};

use std::time::Duration;

/// Deadline for availability probes and model listings.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
