//! Shared session engine types.

use std::fmt;

/// Result of dispatching one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Output to show the peer, marker already removed.
    pub stdout: String,
    pub stderr: String,
    /// Exit status reported by the sandbox, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Tracked directory after the command.
    pub directory: String,
}

/// What the session loop does after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Exit,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer typed an exit command.
    Exit,
    /// The peer closed the connection.
    Disconnected,
    /// The interactive shell exited on its own.
    ShellExited(Option<i32>),
    /// The server is shutting down.
    Shutdown,
    /// A fatal error ended the session.
    Failed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Exit => f.write_str("exit"),
            SessionEnd::Disconnected => f.write_str("peer disconnected"),
            SessionEnd::ShellExited(Some(code)) => write!(f, "shell exited with status {code}"),
            SessionEnd::ShellExited(None) => f.write_str("shell exited"),
            SessionEnd::Shutdown => f.write_str("server shutdown"),
            SessionEnd::Failed(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Resolve once `shutdown` flips to `true`. A dropped sender never resolves.
pub async fn shutdown_signal(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
