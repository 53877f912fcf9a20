//! Model-hint extraction.
//!
//! Users can steer provider/model selection inline: `... use opus`,
//! `... with haiku`, a trailing `, ollama`, or `(local)`. The matched hint
//! is stripped from the prompt before anything downstream sees it.

use regex::Regex;
use std::sync::LazyLock;

/// A recognized hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHint {
    /// Provider name the alias maps to.
    pub provider: &'static str,
    /// Exact model, when the alias pins one.
    pub model: Option<&'static str>,
    /// The alias as written.
    pub alias: String,
}

/// Alias table. Checked case-insensitively.
const ALIASES: &[(&str, &str, Option<&str>)] = &[
    ("opus", "claude", Some("claude-opus-4-1-20250805")),
    ("sonnet", "claude", Some("claude-sonnet-4-20250514")),
    ("haiku", "claude", Some("claude-3-5-haiku-20241022")),
    ("claude", "claude", None),
    ("gpt", "openai", None),
    ("openai", "openai", None),
    ("ollama", "ollama", None),
    ("local", "ollama", None),
];

static LEAD_IN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:use|using|with|via|by)\s+([a-z0-9.-]+)\s*$").expect("lead-in pattern")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i),\s*([a-z0-9.-]+)\s*$").expect("trailing pattern"));
static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*([a-z0-9.-]+)\s*\)\s*$").expect("paren pattern"));

fn alias_lookup(word: &str) -> Option<(&'static str, Option<&'static str>)> {
    let lower = word.to_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _, _)| *alias == lower)
        .map(|(_, provider, model)| (*provider, *model))
}

/// Extract a model hint and return the prompt with the hint removed.
pub fn extract(prompt: &str) -> (String, Option<ModelHint>) {
    for re in [&*LEAD_IN, &*TRAILING_COMMA, &*PARENTHESIZED] {
        if let Some(caps) = re.captures(prompt) {
            let word = caps.get(1).expect("group 1").as_str();
            if let Some((provider, model)) = alias_lookup(word) {
                let stripped = re.replace(prompt, "").trim().to_string();
                return (
                    stripped,
                    Some(ModelHint {
                        provider,
                        model,
                        alias: word.to_lowercase(),
                    }),
                );
            }
        }
    }
    (prompt.trim().to_string(), None)
}
