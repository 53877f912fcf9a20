//! Prompt normalization and trigram similarity.
//!
//! Similarity is the Dice coefficient over 3-character windows of the
//! space-padded normalized string. It is cheap, language-agnostic, and good
//! enough to catch "make me a todo list" vs "todo list app".

use std::collections::HashSet;

/// Words stripped during normalization: articles plus request filler that
/// carries no information about the app itself.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "this", "that", "some", "please", "make", "build", "create", "can", "you",
    "me", "my", "i", "want", "need", "would", "like", "for", "with", "app", "application",
];

/// Lowercase, strip punctuation, collapse whitespace, drop stopwords.
pub fn normalize(prompt: &str) -> String {
    prompt
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trigrams of the space-padded input.
fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = std::iter::once(' ')
        .chain(s.chars())
        .chain(std::iter::once(' '))
        .collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Dice coefficient over trigram sets of two *normalized* strings, in 0–1.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    (2.0 * shared as f64) / (ta.len() + tb.len()) as f64
}

/// Normalize both sides, then compare.
pub fn prompt_similarity(a: &str, b: &str) -> f64 {
    similarity(&normalize(a), &normalize(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_filler() {
        assert_eq!(normalize("Please make me a Todo List!"), "todo list");
        assert_eq!(normalize("Can you build a timer?"), "timer");
    }

    #[test]
    fn normalize_collapses_whitespace_and_punctuation() {
        assert_eq!(normalize("notes -- quick,   searchable"), "notes quick searchable");
    }

    #[test]
    fn identical_normalized_prompts_score_one() {
        let n = normalize("a pomodoro timer");
        assert!((similarity(&n, &n) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rephrased_prompts_score_high() {
        let s = prompt_similarity("make me a todo list", "todo list app");
        assert!(s > 0.8, "got {s}");
    }

    #[test]
    fn unrelated_prompts_score_low() {
        let s = prompt_similarity("a pomodoro timer", "currency converter");
        assert!(s < 0.25, "got {s}");
    }

    #[test]
    fn empty_against_nonempty_is_zero() {
        assert_eq!(prompt_similarity("", "timer"), 0.0);
    }
}
