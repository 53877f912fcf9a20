//! # Helion Kernel
//!
//! Enforcement and core services for the helion kernel.
//!
//! Where `helion-guard` decides what *should* be allowed, this crate holds
//! the state that makes those decisions stick at runtime:
//!
//! - [`TokenService`] / [`CapabilityService`] — HMAC-signed capability
//!   tokens and the per-app grant whitelist. The signing key is generated at
//!   startup, never leaves process memory, and rotates every process
//!   lifetime.
//! - [`AppRegistry`] — the content-addressed store of generated apps, with
//!   trigram search, tags, ratings, and best-effort community sync.
//! - [`AppStorage`] — per-app JSON stores with byte quotas, debounced
//!   flushing, and `cap-std`-rooted paths.
//! - [`KnowledgeBase`] — bounded memory of past generations.
//! - [`Scheduler`] — background tasks under a circuit breaker, daily LLM
//!   budget, activity defer, and a process-wide concurrency lock.
//! - [`ProfileStore`] — the user profile and the ephemeral/solidified
//!   snapshot lifecycle.
//! - [`ShellStore`] / [`AgentTaskQueue`] — shell version history and the
//!   queued agent-task FIFO.
//!
//! Nothing here is a module-level global. The daemon constructs each service
//! once, in dependency order (key → stores → registries → scheduler), and
//! hands them to the HTTP surface and the sandboxes.

pub mod caps;
pub mod error;
pub mod knowledge;
pub mod profile;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod shell;
pub mod storage;
pub mod token;

pub use caps::{CapabilityService, Grant};
pub use error::{KernelError, Result};
pub use knowledge::{KnowledgeBase, KnowledgeEntry};
pub use profile::{Profile, ProfileMode, ProfileStore, SnapshotMeta};
pub use queue::{AgentTask, AgentTaskQueue, AgentTaskStatus};
pub use registry::{
    content_hash, AppEntry, AppRegistry, BrowsePage, BrowseQuery, Published, RegistryStats,
    SearchHit,
};
pub use scheduler::{
    Scheduler, SchedulerConfig, TaskContext, TaskDefinition, TaskHandler, TaskOutcome, TaskState,
    TaskView,
};
pub use shell::{ShellStore, ShellVersion};
pub use storage::{sanitize_app_id, AppStorage, StoreUsage};
pub use token::{TokenError, TokenPayload, TokenService, Verification};
