//! Error types for the sandpit sandbox.

use thiserror::Error;

/// Errors that can occur while building documents or running isolated contexts.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Source failed validation checks.
    #[error("source validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// A source part exceeds the configured maximum size.
    #[error("{part} exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Which bundle part was too large ("script", "markup", ...).
        part: &'static str,
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned runtime-escape pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The host document could not be assembled.
    #[error("document build failed: {reason}")]
    DocumentBuild {
        /// What went wrong.
        reason: String,
    },

    /// Execution result exceeds the configured maximum size.
    #[error("output exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// Execution timed out (test deadline or CPU-bound watchdog).
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A JavaScript error was thrown during execution.
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
    },

    /// An external script could not be resolved for a headless context.
    #[error("script {url} is unavailable: {reason}")]
    ScriptUnavailable {
        /// Requested URL.
        url: String,
        /// Why it could not be loaded.
        reason: String,
    },

    /// The isolated context was disposed or exited before answering.
    #[error("isolated context is no longer running")]
    ContextClosed,

    /// Too many isolated contexts alive at once.
    #[error("concurrency limit reached (max {max} live contexts)")]
    ConcurrencyLimit {
        /// Maximum allowed live contexts.
        max: usize,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Value serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Short, stable label for the error kind, used in audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } | Self::CodeTooLarge { .. } | Self::BannedPattern { .. } => {
                "validation"
            }
            Self::DocumentBuild { .. } => "build",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Timeout { .. } => crate::audit::TIMEOUT_KIND,
            Self::JsError { .. } => "js_error",
            Self::ScriptUnavailable { .. } => "script_unavailable",
            Self::ContextClosed => "context_closed",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::HeapLimitExceeded => "heap_limit",
            Self::Execution(_) => "execution",
            Self::Serialization(_) => "serialization",
        }
    }
}
