//! # Helion Sandbox
//!
//! The two execution substrates for generated apps.
//!
//! - [`wasm::WasmSandbox`] — in-process WebAssembly. Per-app engine and
//!   store, memory validated before compilation and capped at runtime, CPU
//!   bounded by epoch interruption, and synchronous capability-gated host
//!   calls over a 64 KiB ring.
//! - [`container::ProcessManager`] — external containers through the engine
//!   API, under hard resource caps, capability-derived network/volume/env
//!   policy, a bounded host-port range, and a wall clock.
//!
//! Neither sandbox decides policy. Grants are computed upstream (analyzer →
//! capability service) and arrive here as plain capability sets; this crate
//! only enforces them.

pub mod container;
pub mod error;
pub mod wasm;

pub use container::{ProcessConfig, ProcessInfo, ProcessManager, ProcessState};
pub use error::{Result, SandboxError};
pub use wasm::{AppState, LaunchOptions, WasmAppInfo, WasmSandbox};
