//! # Helion Guard
//!
//! The deterministic policy layer of the helion kernel.
//!
//! Everything in this crate is pure computation: no I/O, no async, no clocks.
//! It is the part of the kernel that must give the same answer every time it
//! is asked, because its answers gate what LLM-generated code is allowed to
//! run.
//!
//! ## What lives here
//!
//! - [`Capability`] — the closed set of permissions an app can hold, plus
//!   keyword-based proposal from prompts and app-type inference.
//! - [`RuleEngine`] — the static analyzer: two pre-compiled regex rule sets
//!   (app code, container recipes) producing [`Report`]s of [`Finding`]s.
//!   An analysis passes iff it produced zero critical findings.
//! - [`Sanitizer`] — prompt-injection scrubbing. Sanitizer flags never fail a
//!   request; they are reported alongside it.
//! - [`confidence`] — prompt confidence scoring and complexity
//!   classification, used by the gateway to refuse low-information prompts
//!   before any tokens are spent.
//! - [`trigram`] — prompt normalization and Dice-coefficient similarity,
//!   shared by the registry's search and the gateway's memory lookup.
//!
//! ## Quick start
//!
//! ```rust
//! use helion_guard::{RuleEngine, Capability};
//!
//! let engine = RuleEngine::new();
//! let report = engine.analyze_code("<script>eval(\"x\")</script>");
//! assert!(!report.passed);
//!
//! let caps = helion_guard::propose_capabilities("a timer that saves laps");
//! assert!(caps.contains(&Capability::UiWindow));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

mod analyzer;
mod capability;
pub mod confidence;
mod rules;
mod sanitize;
pub mod trigram;

pub use analyzer::{Finding, Report, RuleEngine, Severity, SDK_MARKER};
pub use capability::{
    infer_app_type, propose_capabilities, AppType, Capability, CapabilityParseError,
};
pub use confidence::{Complexity, ConfidenceReport};
pub use sanitize::{Sanitized, Sanitizer};
