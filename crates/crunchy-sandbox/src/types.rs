//! Sandbox policy, handles, and process execution types.

use crunchy_config::SandboxLimitsConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A pulled image that sandboxes can be created from.
///
/// Produced once at startup and shared read-only by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    /// Reference the image was pulled by.
    pub reference: String,
    /// Runtime-specific identifier for the resolved image.
    pub id: String,
}

/// Handle for one live sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    /// Session id the sandbox (and its snapshot) is derived from.
    pub id: Uuid,
    /// Runtime-visible name, e.g. the container name.
    pub name: String,
}

/// Settings applied when a sandbox is created.
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    /// Resource limits.
    pub limits: SandboxLimits,
    /// Hostname visible inside the sandbox.
    pub hostname: Option<String>,
    /// Whether the sandbox gets network access.
    pub network: bool,
}

/// Resource limits for sandboxed processes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxLimits {
    /// CPU seconds limit.
    pub cpu_seconds: Option<u64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// File descriptor limit.
    pub nofile: Option<u64>,
    /// Process count limit.
    pub pids: Option<u64>,
    /// Fractional CPU share (container runtimes only).
    pub cpus: Option<f64>,
}

impl From<&SandboxLimitsConfig> for SandboxLimits {
    fn from(config: &SandboxLimitsConfig) -> Self {
        Self {
            cpu_seconds: config.cpu_seconds,
            memory_bytes: config.memory_bytes,
            nofile: config.nofile,
            pids: config.pids,
            cpus: config.cpus,
        }
    }
}

/// Unique identifier for one process started inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecId(String);

impl ExecId {
    /// Generate a fresh, never-reused execution id.
    pub fn generate() -> Self {
        Self(format!("exec-{}", Uuid::new_v4().simple()))
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process to start inside a sandbox.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Program and arguments.
    pub args: Vec<String>,
    /// Complete environment; nothing is inherited from the host.
    pub env: BTreeMap<String, String>,
    /// Optional working directory inside the sandbox.
    pub cwd: Option<String>,
    /// Execution id for this invocation.
    pub exec_id: ExecId,
    /// Wall-clock limit the runtime enforces inside the sandbox, if any.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    /// Create a spec with a fresh execution id and an empty environment.
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            env: BTreeMap::new(),
            cwd: None,
            exec_id: ExecId::generate(),
            timeout: None,
        }
    }
}

/// Result of a captured sandbox execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit status code if available.
    pub status_code: Option<i32>,
    /// Captured stdout content.
    pub stdout: String,
    /// Captured stderr content.
    pub stderr: String,
}

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecId, ProcessSpec, SandboxLimits};
    use crunchy_config::SandboxLimitsConfig;
    use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn exec_ids_are_unique() {
        let first = ExecId::generate();
        let second = ExecId::generate();
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("exec-"));
    }

    #[test]
    fn process_spec_defaults_are_empty() {
        let spec = ProcessSpec::new(vec!["/bin/true".to_string()]);
        assert_eq!(spec.args, vec!["/bin/true".to_string()]);
        assert_eq!(spec.cwd, None);
        assert_eq!(spec.env.len(), 0);
    }

    #[test]
    fn limits_follow_config() {
        let config = SandboxLimitsConfig {
            pids: Some(64),
            cpus: Some(0.5),
            ..Default::default()
        };
        let limits = SandboxLimits::from(&config);
        assert_eq!(limits.pids, Some(64));
        assert_eq!(limits.cpus, Some(0.5));
        assert_eq!(limits.memory_bytes, None);
    }
}
