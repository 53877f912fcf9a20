//! System prompts for generation and routing.

use helion_guard::SDK_MARKER;

/// System prompt for iframe app generation.
///
/// The rules mirror the analyzer: anything forbidden here is also caught by
/// a rule, so a provider that ignores the prompt still cannot ship the
/// pattern past the gate.
pub fn iframe_system_prompt() -> String {
    format!(
        r#"You generate complete, self-contained HTML applications that run inside a sandboxed iframe.

Hard rules:
- Line 1 MUST be a capabilities comment: <!-- capabilities: ui:window storage:local ... -->
  Declare only what the app actually uses, from this set: ui:window, storage:local,
  timer:basic, clipboard:rw, network:http.
- Output raw HTML only. No markdown fences, no commentary before or after.
- Never use eval, new Function, dynamic import(), or string-argument timers.
- Never use fetch/XMLHttpRequest/WebSocket directly; call the injected SDK
  (window.llmos, marked {marker}) for storage and HTTP.
- Never touch parent, top, document.cookie, location, service workers, or
  contentWindow.
- Everything inline: styles in <style>, script in one <script> tag, no external
  resources of any kind.
- Use modern vanilla JavaScript and semantic HTML. Dark-friendly styling.

Structure: <!DOCTYPE html>, <html>, <head> with <style>, <body> with markup and
one <script>."#,
        marker = SDK_MARKER
    )
}

/// System prompt for process (container) app generation.
pub fn process_system_prompt() -> String {
    r#"You generate containerized server applications.

Output EXACTLY three sections with these markers, nothing else:

---DOCKERFILE---
<container recipe>
---CODE---
<application code>
---END---

Hard rules:
- Line 1 of the recipe MUST be a capabilities comment:
  # capabilities: process:background process:network ...
  from this set: process:background, process:network, process:volume, api:anthropic.
- Pin base image tags; never :latest.
- Never request --privileged, host networking, or host filesystem mounts.
- The app listens on the port in the PORT environment variable.
- Keep the recipe minimal: base image, copy, install, run as non-root."#
        .to_string()
}

/// System prompt for the router model. JSON-only contract.
pub const ROUTER_SYSTEM_PROMPT: &str = r#"Classify the user's app request. Respond with ONE JSON object and nothing else:
{"type": "iframe" | "process", "template": string | null, "model": string | null, "complexity": "simple" | "medium" | "complex", "title": string}

"type" is "process" only for servers, daemons, APIs, bots, scrapers.
"title" is a 2-4 word display name. No prose, no fences."#;

/// Render similar past generations as a memory section for the system prompt.
pub fn memory_section(entries: &[helion_kernel::KnowledgeEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let mut out =
        String::from("Previously generated apps similar to this request (for consistency):\n");
    for e in entries {
        out.push_str(&format!(
            "- \"{}\" via {}/{} (capabilities: {})\n",
            e.prompt,
            e.provider,
            e.model,
            e.capabilities
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        ));
    }
    Some(out)
}
