//! Error taxonomy for kernel operations.
//!
//! Every outward-facing operation maps its failure into one of these kinds;
//! the HTTP surface translates kinds to status codes. Variants carry enough
//! context to be actionable without leaking internals.

use thiserror::Error;

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors the kernel surfaces to callers.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Bad input from the caller.
    #[error("validation failed: {reason}")]
    Validation {
        /// What was wrong with the input.
        reason: String,
    },

    /// The static analyzer produced critical findings.
    #[error("blocked by static analysis: {critical_count} critical finding(s)")]
    AnalysisBlocked {
        /// Number of critical findings.
        critical_count: usize,
        /// The findings, serialized for the caller.
        findings: Vec<helion_guard::Finding>,
    },

    /// The app does not hold the capability the operation needs.
    #[error("capability denied: app '{app_id}' lacks '{capability}'")]
    CapabilityDenied {
        /// The app that made the request.
        app_id: String,
        /// The capability it lacked.
        capability: String,
    },

    /// A storage quota would be exceeded.
    #[error("quota exceeded for app '{app_id}': {used} + {requested} > {limit} bytes")]
    QuotaExceeded {
        /// The app whose store is full.
        app_id: String,
        /// Bytes currently used.
        used: usize,
        /// Bytes the write would have added.
        requested: usize,
        /// The quota in bytes.
        limit: usize,
    },

    /// A CPU or wall-clock deadline fired.
    #[error("timeout: {what}")]
    Timeout {
        /// Which deadline fired.
        what: String,
    },

    /// No provider is configured/reachable for the request.
    #[error("no provider available{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ProviderUnavailable {
        /// Optional detail.
        reason: Option<String>,
    },

    /// A provider accepted the request and then failed.
    #[error("provider '{provider}' failed: {message}")]
    ProviderFailed {
        /// The provider that failed.
        provider: String,
        /// The provider's error text.
        message: String,
    },

    /// A bounded resource pool (ports, container slots) is exhausted.
    #[error("resource exhausted: {what}")]
    ResourceExhausted {
        /// Which pool ran dry.
        what: String,
    },

    /// The referenced entity does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The operation conflicts with existing state (e.g. duplicate app id).
    #[error("conflict: {what}")]
    Conflict {
        /// The conflicting state.
        what: String,
    },

    /// Anything we did not anticipate.
    #[error("internal error: {0}")]
    Internal(String),

    /// Filesystem errors bubble up unchanged.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// The stable kind string used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Validation { .. } => "validation",
            KernelError::AnalysisBlocked { .. } => "analysis_blocked",
            KernelError::CapabilityDenied { .. } => "capability_denied",
            KernelError::QuotaExceeded { .. } => "quota_exceeded",
            KernelError::Timeout { .. } => "timeout",
            KernelError::ProviderUnavailable { .. } => "provider_unavailable",
            KernelError::ProviderFailed { .. } => "provider_failed",
            KernelError::ResourceExhausted { .. } => "resource_exhausted",
            KernelError::NotFound { .. } => "not_found",
            KernelError::Conflict { .. } => "conflict",
            KernelError::Internal(_) => "internal",
            KernelError::Io(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = KernelError::QuotaExceeded {
            app_id: "a".into(),
            used: 1,
            requested: 2,
            limit: 3,
        };
        assert_eq!(err.kind(), "quota_exceeded");
        assert!(err.to_string().contains("quota"));

        assert_eq!(
            KernelError::ProviderUnavailable { reason: None }.kind(),
            "provider_unavailable"
        );
    }

    #[test]
    fn provider_unavailable_message_with_reason() {
        let err = KernelError::ProviderUnavailable {
            reason: Some("no api key".into()),
        };
        assert!(err.to_string().contains("no api key"));
    }
}
