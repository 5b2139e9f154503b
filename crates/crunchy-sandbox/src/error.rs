//! Sandbox error types.

use uuid::Uuid;

/// Errors returned by sandbox runtimes.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Command execution failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    /// Invalid sandbox configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Missing dependency required by the runtime.
    #[error("dependency missing: {0}")]
    DependencyMissing(String),
    /// The handle does not refer to a live sandbox.
    #[error("unknown sandbox: {0}")]
    UnknownSandbox(Uuid),
    /// A sandbox with this id is still alive.
    #[error("sandbox already exists: {0}")]
    SandboxExists(Uuid),
    /// Another process with the same execution id is still running.
    #[error("execution id already in use: {0}")]
    ExecConflict(String),
}
