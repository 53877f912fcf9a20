//! Deterministic pattern engine over generated code and container recipes.
//!
//! No LLM is in this loop. The engine compiles both rule sets once at
//! construction and produces the same findings for the same input on every
//! call, in rule-table order.

use crate::rules::{RuleSpec, CODE_RULES, RECIPE_RULES};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Marker the gateway injects on SDK bootstrap lines.
///
/// Lines carrying this marker are exempt from analysis: the SDK itself uses
/// primitives (postMessage, fetch) that the rules flag in app code.
pub const SDK_MARKER: &str = "helion-sdk";

/// How bad a finding is. `Critical` blocks; `Warning` is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Blocks execution.
    Critical,
    /// Reported but does not block.
    Warning,
}

/// One rule match.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    /// Stable rule identifier (e.g. `eval-direct`).
    pub rule: &'static str,
    /// Severity of the matched rule.
    pub severity: Severity,
    /// 1-based line number of the match.
    pub line: usize,
    /// The matched line, trimmed and capped for display.
    pub snippet: String,
    /// Human-readable description of why the rule exists.
    pub description: &'static str,
}

/// The outcome of analyzing one input.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// `true` iff no critical rule matched.
    pub passed: bool,
    /// Number of critical findings.
    pub critical_count: usize,
    /// Number of warning findings.
    pub warning_count: usize,
    /// All findings, in rule-table order then line order.
    pub findings: Vec<Finding>,
}

struct CompiledRule {
    spec: &'static RuleSpec,
    re: Regex,
}

/// The static analyzer. Construct once and share; `analyze_*` take `&self`.
pub struct RuleEngine {
    code: Vec<CompiledRule>,
    recipe: Vec<CompiledRule>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    /// Compile both rule sets.
    ///
    /// Panics if a rule table entry fails to compile; the tables are static
    /// and covered by tests, so this is a build-time defect, not input error.
    pub fn new() -> Self {
        Self {
            code: compile(CODE_RULES),
            recipe: compile(RECIPE_RULES),
        }
    }

    /// Analyze an app body (HTML/JS).
    pub fn analyze_code(&self, text: &str) -> Report {
        self.run(&self.code, text, false)
    }

    /// Analyze a container build recipe.
    pub fn analyze_recipe(&self, text: &str) -> Report {
        self.run(&self.recipe, text, true)
    }

    fn run(&self, rules: &[CompiledRule], text: &str, skip_comments: bool) -> Report {
        let lines: Vec<&str> = text.lines().collect();
        let exempt: Vec<bool> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| is_exempt(i, line) || (skip_comments && line.trim_start().starts_with('#')))
            .collect();

        let mut findings = Vec::new();
        for rule in rules {
            if rule.spec.spans_lines {
                for m in rule.re.find_iter(text) {
                    let line_no = line_of_offset(text, m.start());
                    if exempt.get(line_no - 1).copied().unwrap_or(false) {
                        continue;
                    }
                    findings.push(make_finding(rule.spec, line_no, lines[line_no - 1]));
                }
            } else {
                for (i, line) in lines.iter().enumerate() {
                    if exempt[i] {
                        continue;
                    }
                    if rule.re.is_match(line) {
                        findings.push(make_finding(rule.spec, i + 1, line));
                    }
                }
            }
        }

        let critical_count = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        let warning_count = findings.len() - critical_count;
        Report {
            passed: critical_count == 0,
            critical_count,
            warning_count,
            findings,
        }
    }
}

fn compile(specs: &'static [RuleSpec]) -> Vec<CompiledRule> {
    specs
        .iter()
        .map(|spec| CompiledRule {
            spec,
            re: Regex::new(spec.pattern)
                .unwrap_or_else(|e| panic!("rule '{}' failed to compile: {e}", spec.id)),
        })
        .collect()
}

fn make_finding(spec: &'static RuleSpec, line: usize, text: &str) -> Finding {
    let trimmed = text.trim();
    let snippet = if trimmed.len() > 120 {
        let mut end = 120;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    } else {
        trimmed.to_string()
    };
    Finding {
        rule: spec.id,
        severity: spec.severity,
        line,
        snippet,
        description: spec.description,
    }
}

/// Line 1 capability declarations and SDK bootstrap lines are exempt.
fn is_exempt(index: usize, line: &str) -> bool {
    if line.contains(SDK_MARKER) {
        return true;
    }
    if index == 0 {
        let t = line.trim_start();
        return (t.starts_with("<!--") || t.starts_with("//") || t.starts_with('#'))
            && t.to_lowercase().contains("capabilities:");
    }
    false
}

fn line_of_offset(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RuleEngine {
        RuleEngine::new()
    }

    #[test]
    fn eval_is_blocked() {
        let report = engine().analyze_code("<script>eval(\"x\")</script>");
        assert!(!report.passed);
        assert!(report.critical_count >= 1);
        assert!(report.findings.iter().any(|f| f.rule == "eval-direct"));
    }

    #[test]
    fn warnings_do_not_block() {
        let report = engine().analyze_code("el.innerHTML = data;");
        assert!(report.passed);
        assert_eq!(report.critical_count, 0);
        assert!(report.warning_count >= 1);
    }

    #[test]
    fn clean_app_passes() {
        let code = "<!-- capabilities: ui:window -->\n<!DOCTYPE html>\n<html><body>\
                    <h1>Clock</h1><script>const el = document.querySelector('h1');\
                    el.textContent = new Date().toString();</script></body></html>";
        let report = engine().analyze_code(code);
        assert!(report.passed, "findings: {:?}", report.findings);
    }

    #[test]
    fn capability_comment_line_is_exempt() {
        // A hostile capability comment must not trip rules, but the same text
        // on line 2 must.
        let line1 = "<!-- capabilities: ui:window eval( -->\n<p>hi</p>";
        assert!(engine().analyze_code(line1).passed);

        let line2 = "<p>hi</p>\n<!-- capabilities: ui:window eval( -->";
        assert!(!engine().analyze_code(line2).passed);
    }

    #[test]
    fn sdk_marker_lines_are_exempt() {
        let code = format!("<script>/* {SDK_MARKER} */ window.parent.postMessage(m, origin)</script>");
        assert!(engine().analyze_code(&code).passed);
    }

    #[test]
    fn finding_lines_are_one_based() {
        let report = engine().analyze_code("<p>ok</p>\n<script>eval('x')</script>");
        let f = report
            .findings
            .iter()
            .find(|f| f.rule == "eval-direct")
            .unwrap();
        assert_eq!(f.line, 2);
    }

    #[test]
    fn indirect_eval_variants() {
        for payload in [
            "(0,eval)('x')",
            "window['eval']('x')",
            "globalThis['eval']('x')",
            "const f = 'ev' + 'al';",
        ] {
            let report = engine().analyze_code(payload);
            assert!(!report.passed, "should block: {payload}");
        }
    }

    #[test]
    fn svg_script_spans_lines() {
        let code = "<svg viewBox=\"0 0 1 1\">\n  <circle r=\"1\"/>\n  <script>steal()</script>\n</svg>";
        let report = engine().analyze_code(code);
        assert!(report.findings.iter().any(|f| f.rule == "svg-script"));
        assert!(!report.passed);
    }

    #[test]
    fn repeated_analysis_is_deterministic() {
        let code = "eval('a');\nfetch('http://x');\ndocument.cookie;";
        let a = engine().analyze_code(code);
        let b = engine().analyze_code(code);
        assert_eq!(a.findings.len(), b.findings.len());
        for (x, y) in a.findings.iter().zip(b.findings.iter()) {
            assert_eq!(x.rule, y.rule);
            assert_eq!(x.line, y.line);
        }
    }

    #[test]
    fn recipe_privileged_is_blocked() {
        let recipe = "FROM alpine:3.20\nRUN echo ok\n# docker run --privileged is needed\nCMD [\"/app\"]";
        // Comment lines are ignored, so this passes.
        assert!(engine().analyze_recipe(recipe).passed);

        let hot = "FROM alpine:3.20\nLABEL run-args=\"--privileged\"";
        assert!(!engine().analyze_recipe(hot).passed);
    }

    #[test]
    fn recipe_latest_is_warned() {
        let report = engine().analyze_recipe("FROM node:latest\nCMD [\"node\"]");
        assert!(report.passed);
        assert!(report.findings.iter().any(|f| f.rule == "unpinned-base"));
    }

    #[test]
    fn recipe_host_network_blocked() {
        let report = engine().analyze_recipe("FROM alpine:3.20\nLABEL args=\"--network host\"");
        assert!(!report.passed);
    }
}
