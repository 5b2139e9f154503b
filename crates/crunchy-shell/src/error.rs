//! Session error types.

use crunchy_sandbox::SandboxError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while running a pseudo-shell session.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Reading from or writing to the peer failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The session's sandbox could not be created.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(#[source] SandboxError),
    /// A command could not be started or awaited.
    #[error("{0}")]
    Execution(#[source] SandboxError),
    /// A command ran longer than the configured limit.
    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// The session log could not be opened.
    #[error("failed to open session log {}: {source}", path.display())]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShellError {
    /// Whether the error ends the session rather than a single command.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShellError::Transport(_) | ShellError::SandboxCreation(_) | ShellError::Audit { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ShellError;
    use crunchy_sandbox::SandboxError;
    use std::time::Duration;

    #[test]
    fn per_command_failures_are_recoverable() {
        let exec = ShellError::Execution(SandboxError::ExecutionFailed("boom".to_string()));
        assert!(!exec.is_fatal());
        assert!(!ShellError::Timeout(Duration::from_secs(5)).is_fatal());
        assert_eq!(exec.to_string(), "execution failed: boom");
    }

    #[test]
    fn transport_and_setup_failures_are_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(ShellError::Transport(io).is_fatal());
        let create = ShellError::SandboxCreation(SandboxError::ExecutionFailed("no".to_string()));
        assert!(create.is_fatal());
    }
}
