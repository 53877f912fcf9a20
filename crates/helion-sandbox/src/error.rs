//! Sandbox error types.

use thiserror::Error;

/// Failures from either sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The module or recipe failed pre-execution validation.
    #[error("{0}")]
    Validation(String),

    /// The module imports a capability the app was not granted.
    #[error("{capability} not granted")]
    CapabilityDenied {
        /// The missing capability's wire name.
        capability: String,
    },

    /// An app with this id is already running.
    #[error("app '{app_id}' is already running")]
    Duplicate {
        /// The conflicting app id.
        app_id: String,
    },

    /// The CPU deadline fired.
    #[error("CPU timeout after {ms} ms")]
    CpuTimeout {
        /// The configured deadline.
        ms: u64,
    },

    /// The app was killed while running.
    #[error("killed")]
    Killed,

    /// The requested entry export does not exist.
    #[error("no exported function '{name}'")]
    NoExportedFunction {
        /// The export that was looked up.
        name: String,
    },

    /// The module trapped or the engine failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Ports or container slots ran out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The referenced app is not known to the sandbox.
    #[error("app '{0}' not found")]
    NotFound(String),

    /// The container engine refused or failed a request.
    #[error("container engine: {0}")]
    Engine(String),

    /// Filesystem errors bubble up unchanged.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

impl From<SandboxError> for helion_kernel::KernelError {
    fn from(err: SandboxError) -> Self {
        use helion_kernel::KernelError;
        match err {
            SandboxError::Validation(reason) => KernelError::Validation { reason },
            SandboxError::CapabilityDenied { capability } => KernelError::CapabilityDenied {
                app_id: String::new(),
                capability,
            },
            SandboxError::Duplicate { app_id } => KernelError::Conflict {
                what: format!("app {app_id} already running"),
            },
            SandboxError::CpuTimeout { ms } => KernelError::Timeout {
                what: format!("CPU timeout after {ms} ms"),
            },
            SandboxError::Killed => KernelError::Conflict {
                what: "app killed".into(),
            },
            SandboxError::NoExportedFunction { name } => KernelError::Validation {
                reason: format!("no exported function '{name}'"),
            },
            SandboxError::Execution(msg) => KernelError::Internal(msg),
            SandboxError::ResourceExhausted(what) => KernelError::ResourceExhausted { what },
            SandboxError::NotFound(what) => KernelError::NotFound { what },
            SandboxError::Engine(msg) => KernelError::Internal(msg),
            SandboxError::Io(err) => KernelError::Io(err),
        }
    }
}
