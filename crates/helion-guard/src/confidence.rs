//! Prompt confidence scoring and complexity classification.
//!
//! The gateway refuses to spend tokens on prompts it cannot act on. The
//! score is a weighted mean of four 0–1 components; below
//! [`CLARIFICATION_THRESHOLD`] the gateway returns clarification questions
//! instead of calling a provider (unless the caller forces generation).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Scores below this produce a clarification request.
pub const CLARIFICATION_THRESHOLD: f64 = 0.45;

const WEIGHT_LENGTH: f64 = 0.2;
const WEIGHT_SPECIFICITY: f64 = 0.3;
const WEIGHT_CLARITY: f64 = 0.3;
const WEIGHT_CAPABILITY: f64 = 0.2;

static SPECIFICITY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // UI vocabulary
        r"(?i)\b(?:button|list|grid|table|form|input|chart|canvas|slider|tab|card|panel)\b",
        // Action vocabulary
        r"(?i)\b(?:add|edit|delete|drag|sort|filter|search|toggle|count|track|draw|play)\b",
        // Data vocabulary
        r"(?i)\b(?:task|note|item|entry|record|score|lap|event|message|file|image|song)\b",
        // Layout vocabulary
        r"(?i)\b(?:dark|light|column|row|sidebar|header|footer|fullscreen|responsive|minimal)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("specificity pattern"))
    .collect()
});

static VAGUE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bsomething\b",
        r"(?i)\banything\b",
        r"(?i)\bwhatever\b",
        r"(?i)\bsome\s+kind\s+of\b",
        r"(?i)\bmaybe\b",
        r"(?i)\bor\s+something\b",
        r"(?i)\betc\.?\b",
        r"(?i)\bstuff\b",
        r"(?i)\bcool\b",
        r"(?i)\bnice\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("vague pattern"))
    .collect()
});

/// Capability-suggesting vocabulary (storage, timing, network, clipboard).
static CAPABILITY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:save|store|persist|remember|history|load)\b",
        r"(?i)\b(?:timer|countdown|alarm|remind|schedule|interval)\b",
        r"(?i)\b(?:fetch|api|http|weather|news|feed|online)\b",
        r"(?i)\b(?:clipboard|copy|paste)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("capability pattern"))
    .collect()
});

/// The per-component breakdown behind a confidence score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceReport {
    /// Weighted mean of the four components, 0–1.
    pub score: f64,
    /// Word-count component.
    pub length: f64,
    /// Hits against UI/action/data/layout vocabulary.
    pub specificity: f64,
    /// 1 minus the vagueness penalty.
    pub clarity: f64,
    /// Hits against capability-suggesting vocabulary.
    pub capability: f64,
}

impl ConfidenceReport {
    /// True when the score clears the clarification threshold.
    pub fn is_confident(&self) -> bool {
        self.score >= CLARIFICATION_THRESHOLD
    }
}

/// Score a (sanitized) prompt.
pub fn score(prompt: &str) -> ConfidenceReport {
    let words = prompt.split_whitespace().count();

    // 3 words is barely a prompt, 12+ is a healthy description.
    let length = ((words as f64 - 2.0) / 10.0).clamp(0.0, 1.0);

    let hits = SPECIFICITY_PATTERNS
        .iter()
        .filter(|re| re.is_match(prompt))
        .count();
    let specificity = hits as f64 / SPECIFICITY_PATTERNS.len() as f64;

    let vague = VAGUE_PATTERNS.iter().filter(|re| re.is_match(prompt)).count();
    let clarity = (1.0 - 0.25 * vague as f64).clamp(0.0, 1.0);

    let cap_hits = CAPABILITY_PATTERNS
        .iter()
        .filter(|re| re.is_match(prompt))
        .count();
    let capability = (0.4 + 0.3 * cap_hits as f64).clamp(0.0, 1.0);

    let score = WEIGHT_LENGTH * length
        + WEIGHT_SPECIFICITY * specificity
        + WEIGHT_CLARITY * clarity
        + WEIGHT_CAPABILITY * capability;

    ConfidenceReport {
        score,
        length,
        specificity,
        clarity,
        capability,
    }
}

/// Generate up to three clarification questions for a low-confidence prompt.
///
/// Questions target the weakest components so the user's answer actually
/// moves the score.
pub fn clarification_questions(report: &ConfidenceReport, prompt: &str) -> Vec<String> {
    let mut questions = Vec::new();

    if report.length < 0.4 {
        questions.push(format!(
            "Can you describe \"{}\" in a sentence or two? What should it do?",
            prompt.trim()
        ));
    }
    if report.specificity < 0.3 {
        questions.push(
            "What should the interface look like — a list, a grid, buttons, a canvas?"
                .to_string(),
        );
    }
    if report.clarity < 0.75 {
        questions.push(
            "There are some open-ended words in the request. Can you pin down exactly what it should include?"
                .to_string(),
        );
    }
    if report.capability < 0.5 && questions.len() < 3 {
        questions.push(
            "Should it remember anything between sessions, or reach the network?".to_string(),
        );
    }

    questions.truncate(3);
    questions
}

/// Prompt complexity, used for model-tier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Single-concern, small prompt.
    Simple,
    /// One complex keyword or a medium-length description.
    Medium,
    /// Multiple complex keywords or a long description.
    Complex,
}

const COMPLEX_KEYWORDS: &[&str] = &[
    "game",
    "simulation",
    "physics",
    "3d",
    "multiplayer",
    "editor",
    "compiler",
    "interpreter",
    "spreadsheet",
    "synthesizer",
    "drag and drop",
    "real-time",
    "realtime",
    "animation",
    "chart",
    "algorithm",
];

/// Classify a prompt's complexity.
///
/// Two complex-keyword hits or more than 80 words is complex; one hit or more
/// than 40 words is medium; everything else is simple.
pub fn complexity(prompt: &str) -> Complexity {
    let lower = prompt.to_lowercase();
    let hits = COMPLEX_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .count();
    let words = prompt.split_whitespace().count();

    if hits >= 2 || words > 80 {
        Complexity::Complex
    } else if hits >= 1 || words > 40 {
        Complexity::Medium
    } else {
        Complexity::Simple
    }
}
