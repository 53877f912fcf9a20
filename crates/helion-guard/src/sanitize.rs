//! Prompt-injection scrubbing.
//!
//! The sanitizer never rejects a prompt. It removes the patterns we know are
//! used to smuggle instructions past the system prompt and reports which ones
//! fired, so the caller can surface them next to the result.

use regex::Regex;
use std::sync::LazyLock;

/// One scrubbing pattern: a stable name plus the regex that removes it.
struct InjectionPattern {
    name: &'static str,
    pattern: &'static str,
}

const INJECTION_PATTERNS: &[InjectionPattern] = &[
    InjectionPattern {
        name: "ignore-previous",
        pattern: r"(?i)ignore\s+(?:all\s+)?previous\s+instructions?",
    },
    InjectionPattern {
        name: "role-reassignment",
        pattern: r"(?i)you\s+are\s+now\s+(?:a|an|the)?\s*\w+",
    },
    InjectionPattern {
        name: "role-prefix",
        pattern: r"(?im)^\s*(?:system|assistant|human)\s*:",
    },
    InjectionPattern {
        name: "disregard",
        pattern: r"(?i)disregard\s+(?:the\s+)?(?:above|previous|prior|all)",
    },
    InjectionPattern {
        name: "override",
        pattern: r"(?i)override\s+(?:the\s+)?(?:system|safety|previous)",
    },
    InjectionPattern {
        name: "forget",
        pattern: r"(?i)forget\s+(?:everything|all|your|the)\s+\w+",
    },
    InjectionPattern {
        name: "fenced-role-block",
        pattern: r"(?is)```\s*(?:system|assistant)\b.*?```",
    },
    InjectionPattern {
        name: "xml-system-tag",
        pattern: r"(?is)<\s*/?\s*system\s*>",
    },
];

static COMPILED: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    INJECTION_PATTERNS
        .iter()
        .map(|p| {
            let re = Regex::new(p.pattern).unwrap_or_else(|e| {
                panic!("invalid injection pattern '{}': {e}", p.name);
            });
            (p.name, re)
        })
        .collect()
});

/// The outcome of sanitizing a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    /// The scrubbed prompt text.
    pub text: String,
    /// Names of the injection patterns that matched (empty when clean).
    pub flags: Vec<&'static str>,
}

impl Sanitized {
    /// True when no injection pattern fired.
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Prompt sanitizer. Stateless; construct once and share.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sanitizer;

impl Sanitizer {
    /// Create a sanitizer.
    pub fn new() -> Self {
        Self
    }

    /// Strip zero-width characters and known injection patterns.
    pub fn sanitize(&self, prompt: &str) -> Sanitized {
        let mut text: String = prompt
            .chars()
            .filter(|c| !is_zero_width(*c))
            .collect();

        let mut flags = Vec::new();
        for (name, re) in COMPILED.iter() {
            if re.is_match(&text) {
                flags.push(*name);
                text = re.replace_all(&text, "").into_owned();
            }
        }

        // Collapse whitespace runs the removals leave behind.
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Sanitized { text, flags }
    }
}

/// Zero-width and direction-control characters used to hide payloads.
fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{FEFF}')
}
