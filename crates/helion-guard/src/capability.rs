//! The closed capability set and prompt-driven proposal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A permission an app can hold.
///
/// The set is closed: generated code may *declare* anything, but only these
/// identifiers survive a grant. Everything else is dropped at the
/// intersection in the capability service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Render a window in the shell.
    #[serde(rename = "ui:window")]
    UiWindow,
    /// Read/write the app's persistent key-value store.
    #[serde(rename = "storage:local")]
    StorageLocal,
    /// Use timers (setTimeout-style scheduling in the shell runtime).
    #[serde(rename = "timer:basic")]
    TimerBasic,
    /// Read and write the clipboard.
    #[serde(rename = "clipboard:rw")]
    ClipboardRw,
    /// Outbound HTTP through the kernel.
    #[serde(rename = "network:http")]
    NetworkHttp,
    /// Run as a background container process.
    #[serde(rename = "process:background")]
    ProcessBackground,
    /// Container gets a network (otherwise network mode is `none`).
    #[serde(rename = "process:network")]
    ProcessNetwork,
    /// Container gets a persistent volume bind.
    #[serde(rename = "process:volume")]
    ProcessVolume,
    /// The Anthropic API key is injected into the app's environment.
    #[serde(rename = "api:anthropic")]
    ApiAnthropic,
}

impl Capability {
    /// Every member of the closed set, in declaration order.
    pub const ALL: [Capability; 9] = [
        Capability::UiWindow,
        Capability::StorageLocal,
        Capability::TimerBasic,
        Capability::ClipboardRw,
        Capability::NetworkHttp,
        Capability::ProcessBackground,
        Capability::ProcessNetwork,
        Capability::ProcessVolume,
        Capability::ApiAnthropic,
    ];

    /// The wire name (`ui:window`, `storage:local`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::UiWindow => "ui:window",
            Capability::StorageLocal => "storage:local",
            Capability::TimerBasic => "timer:basic",
            Capability::ClipboardRw => "clipboard:rw",
            Capability::NetworkHttp => "network:http",
            Capability::ProcessBackground => "process:background",
            Capability::ProcessNetwork => "process:network",
            Capability::ProcessVolume => "process:volume",
            Capability::ApiAnthropic => "api:anthropic",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a member of the capability set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown capability '{0}'")]
pub struct CapabilityParseError(pub String);

impl FromStr for Capability {
    type Err = CapabilityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ui:window" => Ok(Capability::UiWindow),
            "storage:local" => Ok(Capability::StorageLocal),
            "timer:basic" => Ok(Capability::TimerBasic),
            "clipboard:rw" => Ok(Capability::ClipboardRw),
            "network:http" => Ok(Capability::NetworkHttp),
            "process:background" => Ok(Capability::ProcessBackground),
            "process:network" => Ok(Capability::ProcessNetwork),
            "process:volume" => Ok(Capability::ProcessVolume),
            "api:anthropic" => Ok(Capability::ApiAnthropic),
            other => Err(CapabilityParseError(other.to_string())),
        }
    }
}

/// The execution substrate an app targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Sandboxed HTML rendered by the shell.
    Iframe,
    /// External container process.
    Process,
    /// In-process WebAssembly module.
    Wasm,
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppType::Iframe => "iframe",
            AppType::Process => "process",
            AppType::Wasm => "wasm",
        };
        f.write_str(s)
    }
}

/// Keyword table mapping prompt vocabulary to capabilities.
///
/// Deliberately coarse: the proposal is a starting point that the user (or
/// the generated code's own declaration) refines, never an automatic grant.
const KEYWORD_TABLE: &[(&str, Capability)] = &[
    ("save", Capability::StorageLocal),
    ("store", Capability::StorageLocal),
    ("remember", Capability::StorageLocal),
    ("persist", Capability::StorageLocal),
    ("history", Capability::StorageLocal),
    ("note", Capability::StorageLocal),
    ("todo", Capability::StorageLocal),
    ("timer", Capability::TimerBasic),
    ("clock", Capability::TimerBasic),
    ("countdown", Capability::TimerBasic),
    ("pomodoro", Capability::TimerBasic),
    ("stopwatch", Capability::TimerBasic),
    ("remind", Capability::TimerBasic),
    ("alarm", Capability::TimerBasic),
    ("clipboard", Capability::ClipboardRw),
    ("copy", Capability::ClipboardRw),
    ("paste", Capability::ClipboardRw),
    ("fetch", Capability::NetworkHttp),
    ("http", Capability::NetworkHttp),
    ("api", Capability::NetworkHttp),
    ("weather", Capability::NetworkHttp),
    ("download", Capability::NetworkHttp),
    ("rss", Capability::NetworkHttp),
    ("server", Capability::ProcessBackground),
    ("daemon", Capability::ProcessBackground),
    ("background", Capability::ProcessBackground),
    ("webhook", Capability::ProcessNetwork),
    ("port", Capability::ProcessNetwork),
    ("database", Capability::ProcessVolume),
    ("claude", Capability::ApiAnthropic),
    ("anthropic", Capability::ApiAnthropic),
    ("llm", Capability::ApiAnthropic),
];

/// Propose capabilities for a prompt by keyword inspection.
///
/// Always includes [`Capability::UiWindow`]; every app gets to draw itself.
/// The result is sorted and deduplicated so callers can compare proposals.
pub fn propose_capabilities(prompt: &str) -> Vec<Capability> {
    let lower = prompt.to_lowercase();
    let mut caps = vec![Capability::UiWindow];
    for (keyword, cap) in KEYWORD_TABLE {
        if lower.contains(keyword) && !caps.contains(cap) {
            caps.push(*cap);
        }
    }
    caps.sort();
    caps.dedup();
    caps
}

/// Vocabulary that routes a prompt to the container substrate.
const PROCESS_KEYWORDS: &[&str] = &[
    "server",
    "daemon",
    "service",
    "backend",
    "background job",
    "cron",
    "worker",
    "listen on port",
    "rest api",
    "http api",
    "websocket server",
    "scraper",
    "bot",
    "database",
];

/// Infer whether a prompt describes a shell app or a container process.
///
/// This is the static half of app-type routing. The LLM router's verdict,
/// when available, takes precedence over this one.
pub fn infer_app_type(prompt: &str) -> AppType {
    let lower = prompt.to_lowercase();
    for keyword in PROCESS_KEYWORDS {
        if lower.contains(keyword) {
            return AppType::Process;
        }
    }
    AppType::Iframe
}
