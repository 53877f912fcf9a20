//! Static rule tables for the analyzer.
//!
//! Two sets: `CODE_RULES` run against generated app bodies (HTML/JS),
//! `RECIPE_RULES` run against container build recipes. Patterns are written
//! for the `regex` crate: no lookaround, no backreferences. Rules that must
//! see across line boundaries set `spans_lines` and are matched against the
//! whole input instead of line-by-line.

use crate::analyzer::Severity;

/// A single rule before compilation.
pub(crate) struct RuleSpec {
    /// Stable identifier surfaced in findings.
    pub id: &'static str,
    pub severity: Severity,
    pub pattern: &'static str,
    pub description: &'static str,
    /// Match against the whole text rather than individual lines.
    pub spans_lines: bool,
}

macro_rules! rule {
    ($id:expr, $sev:ident, $pat:expr, $desc:expr) => {
        RuleSpec {
            id: $id,
            severity: Severity::$sev,
            pattern: $pat,
            description: $desc,
            spans_lines: false,
        }
    };
    ($id:expr, $sev:ident, $pat:expr, $desc:expr, spans_lines) => {
        RuleSpec {
            id: $id,
            severity: Severity::$sev,
            pattern: $pat,
            description: $desc,
            spans_lines: true,
        }
    };
}

pub(crate) const CODE_RULES: &[RuleSpec] = &[
    rule!(
        "eval-direct",
        Critical,
        r"\beval\s*\(",
        "direct eval() executes arbitrary strings"
    ),
    rule!(
        "function-constructor",
        Critical,
        r#"\bnew\s+Function\s*\(|\bFunction\s*\(\s*["']"#,
        "Function constructor compiles strings to code"
    ),
    rule!(
        "dynamic-import",
        Critical,
        r"\bimport\s*\(",
        "dynamic import() loads code at runtime"
    ),
    rule!(
        "frame-escape",
        Critical,
        r"\b(?:window\s*\.\s*)?(?:parent|top)\s*\.\s*(?:location|document|window|frames|postMessage|eval)",
        "parent/top access escapes the frame boundary"
    ),
    rule!(
        "cookie-access",
        Critical,
        r"document\s*\.\s*cookie",
        "cookie access leaks shell session state"
    ),
    rule!(
        "raw-network",
        Warning,
        r"\bfetch\s*\(|\bXMLHttpRequest\b|\bnew\s+WebSocket\s*\(",
        "direct network primitive bypasses the capability-mediated SDK"
    ),
    rule!(
        "string-timer",
        Critical,
        r#"\bset(?:Timeout|Interval)\s*\(\s*["']"#,
        "string-argument timer is an eval in disguise"
    ),
    rule!(
        "encoded-payload",
        Warning,
        r"\batob\s*\(|String\s*\.\s*fromCharCode\s*\(",
        "base64/charcode decoding often hides a payload"
    ),
    rule!(
        "prototype-pollution",
        Critical,
        r#"__proto__|Object\s*\.\s*prototype\s*\[|constructor\s*\[\s*["']prototype["']\s*\]"#,
        "prototype pollution rewrites shared object behavior"
    ),
    rule!(
        "global-override",
        Critical,
        r"\b(?:window|globalThis|self)\s*\.\s*(?:eval|fetch|XMLHttpRequest|postMessage)\s*=",
        "overriding a global hook intercepts other apps"
    ),
    rule!(
        "inline-handler-danger",
        Critical,
        r#"\bon(?:click|load|error|mouseover|focus|input)\s*=\s*["'][^"']*(?:eval|fetch|document\s*\.\s*cookie|parent\.)"#,
        "inline event handler invoking a dangerous API"
    ),
    rule!(
        "eval-indirect",
        Critical,
        r#"\(\s*0\s*,\s*eval\s*\)|\b(?:window|globalThis|self)\s*\[\s*["']eval["']\s*\]|["']ev["']\s*\+\s*["']al["']"#,
        "indirect eval via comma operator or computed access"
    ),
    rule!(
        "document-write",
        Warning,
        r"document\s*\.\s*write(?:ln)?\s*\(",
        "document.write can rewrite the frame after load"
    ),
    rule!(
        "inner-html",
        Warning,
        r"\.\s*(?:innerHTML|outerHTML)\s*=",
        "innerHTML assignment invites markup injection"
    ),
    rule!(
        "blob-url",
        Warning,
        r"URL\s*\.\s*createObjectURL\s*\(|\bnew\s+Blob\s*\(",
        "Blob URLs create same-origin executable resources"
    ),
    rule!(
        "shared-array-buffer",
        Critical,
        r"\bSharedArrayBuffer\b",
        "SharedArrayBuffer enables timing side channels"
    ),
    rule!(
        "webrtc",
        Critical,
        r"\bRTCPeerConnection\b|\bRTCDataChannel\b",
        "WebRTC opens peer connections outside the HTTP gate"
    ),
    rule!(
        "import-scripts",
        Critical,
        r"\bimportScripts\s*\(",
        "importScripts pulls remote code into a worker"
    ),
    rule!(
        "location-redirect",
        Critical,
        r"(?:window\s*\.\s*|document\s*\.\s*)?\blocation\s*(?:\.\s*href)?\s*=[^=]|\blocation\s*\.\s*(?:assign|replace)\s*\(",
        "location assignment navigates the frame away"
    ),
    rule!(
        "postmessage-wildcard",
        Warning,
        r#"postMessage\s*\([^)]*,\s*["']\*["']"#,
        "wildcard-origin postMessage broadcasts to any listener"
    ),
    rule!(
        "mutation-observer",
        Warning,
        r"\bMutationObserver\b",
        "MutationObserver can watch shell-injected DOM"
    ),
    rule!(
        "pixel-exfil",
        Critical,
        r#"new\s+Image\s*\(\s*\)(?s:.){0,80}\.\s*src\s*=|navigator\s*\.\s*sendBeacon\s*\("#,
        "image/beacon request exfiltrates data in a URL",
        spans_lines
    ),
    rule!(
        "frame-handle",
        Critical,
        r"\bcontentWindow\b|\bframeElement\b",
        "frame handles reach across the sandbox boundary"
    ),
    rule!(
        "dns-prefetch",
        Warning,
        r#"rel\s*=\s*["'](?:dns-prefetch|preconnect)["']"#,
        "dns-prefetch/preconnect leaks hostnames before any request"
    ),
    rule!(
        "service-worker",
        Critical,
        r"serviceWorker\s*\.\s*register|navigator\s*\.\s*serviceWorker",
        "service worker registration persists beyond the app"
    ),
    rule!(
        "iframe-injection",
        Critical,
        r#"createElement\s*\(\s*["']iframe["']\s*\)|<iframe[^>]+src\s*=\s*["']https?:"#,
        "injected iframe loads an uncontrolled origin"
    ),
    rule!(
        "svg-script",
        Critical,
        r"(?is)<svg[^>]*>.{0,2000}?<script",
        "SVG with inline script executes outside the script gate",
        spans_lines
    ),
    rule!(
        "css-remote",
        Warning,
        r#"@import\s+(?:url\s*\(\s*)?["']?https?://|url\s*\(\s*["']?https?://"#,
        "remote CSS import fetches from an uncontrolled origin"
    ),
];

pub(crate) const RECIPE_RULES: &[RuleSpec] = &[
    rule!(
        "privileged",
        Critical,
        r"--privileged\b",
        "privileged containers own the host"
    ),
    rule!(
        "host-network",
        Critical,
        r"--net(?:work)?[=\s]+host\b",
        "host networking removes network isolation"
    ),
    rule!(
        "rootfs-mount",
        Critical,
        r"(?:-v|--volume)[=\s]+/:\S*|VOLUME\s+/\s*$",
        "mounting the root filesystem exposes the host"
    ),
    rule!(
        "unpinned-base",
        Warning,
        r"(?i)^FROM\s+\S+:latest\b",
        "unpinned :latest base image is not reproducible"
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn all_patterns_compile() {
        for spec in CODE_RULES.iter().chain(RECIPE_RULES.iter()) {
            Regex::new(spec.pattern)
                .unwrap_or_else(|e| panic!("rule '{}' failed to compile: {e}", spec.id));
        }
    }

    #[test]
    fn rule_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for spec in CODE_RULES.iter().chain(RECIPE_RULES.iter()) {
            assert!(seen.insert(spec.id), "duplicate rule id '{}'", spec.id);
        }
    }
}
