//! Property-based tests for the policy layer.
//!
//! These pin the algebraic guarantees the rest of the kernel leans on:
//! analyzer verdicts are a pure function of critical counts, sanitization is
//! idempotent, and trigram similarity is a bounded symmetric measure.

use helion_guard::confidence::{self, Complexity};
use helion_guard::trigram;
use helion_guard::{RuleEngine, Sanitizer, Severity};
use proptest::prelude::*;

proptest! {
    /// passed ⇔ zero critical findings, for arbitrary input.
    #[test]
    fn passed_iff_no_criticals(input in ".{0,400}") {
        let engine = RuleEngine::new();
        let report = engine.analyze_code(&input);
        let criticals = report
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        prop_assert_eq!(report.passed, criticals == 0);
        prop_assert_eq!(report.critical_count, criticals);
        prop_assert_eq!(
            report.warning_count + report.critical_count,
            report.findings.len()
        );
    }

    /// Analysis is deterministic across repeated calls on the same engine.
    #[test]
    fn analysis_is_deterministic(input in ".{0,400}") {
        let engine = RuleEngine::new();
        let a = engine.analyze_code(&input);
        let b = engine.analyze_code(&input);
        prop_assert_eq!(a.findings.len(), b.findings.len());
        prop_assert_eq!(a.passed, b.passed);
    }

    /// Sanitizing twice is the same as sanitizing once.
    #[test]
    fn sanitize_is_idempotent(input in ".{0,300}") {
        let sanitizer = Sanitizer::new();
        let once = sanitizer.sanitize(&input);
        let twice = sanitizer.sanitize(&once.text);
        prop_assert_eq!(&once.text, &twice.text);
        prop_assert!(twice.is_clean());
    }

    /// The sanitized text never contains zero-width characters.
    #[test]
    fn sanitize_strips_zero_width(input in ".{0,300}") {
        let out = Sanitizer::new().sanitize(&input);
        let has_zero_width = out.text.chars().any(|c| matches!(c, '\u{200B}'..='\u{200F}' | '\u{FEFF}'));
        prop_assert!(!has_zero_width);
    }

    /// Similarity is symmetric and bounded.
    #[test]
    fn similarity_symmetric_and_bounded(a in "[a-z ]{0,60}", b in "[a-z ]{0,60}") {
        let ab = trigram::prompt_similarity(&a, &b);
        let ba = trigram::prompt_similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab));
    }

    /// A non-empty normalized prompt is maximally similar to itself.
    #[test]
    fn similarity_reflexive(a in "[a-z]{3,40}") {
        let n = trigram::normalize(&a);
        prop_assume!(!n.is_empty());
        prop_assert!((trigram::similarity(&n, &n) - 1.0).abs() < 1e-12);
    }

    /// Confidence scores stay in the unit interval.
    #[test]
    fn confidence_bounded(prompt in ".{0,300}") {
        let report = confidence::score(&prompt);
        prop_assert!((0.0..=1.0).contains(&report.score));
        for part in [report.length, report.specificity, report.clarity, report.capability] {
            prop_assert!((0.0..=1.0).contains(&part));
        }
    }

    /// Complexity never panics and is monotone-ish in raw length.
    #[test]
    fn complexity_total(prompt in ".{0,600}") {
        let _ = confidence::complexity(&prompt);
        let long = "word ".repeat(100);
        prop_assert_eq!(confidence::complexity(&long), Complexity::Complex);
    }
}
