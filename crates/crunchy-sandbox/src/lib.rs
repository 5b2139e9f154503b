//! Sandbox runtimes: one disposable, isolated environment per session.

pub mod error;
pub mod provider;
pub mod pty;
pub mod types;

use crunchy_config::{CrunchyConfig, SandboxConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Sandbox error type.
pub use error::SandboxError;
/// Runtime traits and helpers.
pub use provider::{
    DependencyReport, ExecGuard, SandboxRegistry, SandboxRuntime, TerminalProcess,
    docker::{DockerOptions, DockerRuntime},
};
/// Core sandbox types and policies.
pub use types::{
    CommandResult, ExecId, ImageHandle, ProcessSpec, SandboxHandle, SandboxLimits, SandboxPolicy,
    TerminalSize,
};

#[cfg(target_os = "linux")]
/// Bubblewrap runtime for Linux.
pub use provider::linux::{BubblewrapOptions, BubblewrapRuntime, HOST_IMAGE};

/// Snapshot directory used when `sandbox.snapshot_root` is unset.
pub fn default_snapshot_root(config: &SandboxConfig) -> PathBuf {
    config
        .snapshot_root
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(&config.name_prefix))
}

/// Build the runtime selected by `sandbox.provider`.
pub fn build_runtime(config: &CrunchyConfig) -> Result<Arc<dyn SandboxRuntime>, SandboxError> {
    let max_output_bytes = config.shell.max_output_bytes;
    match config.sandbox.provider.as_str() {
        "docker" => Ok(Arc::new(DockerRuntime::new(DockerOptions {
            name_prefix: config.sandbox.name_prefix.clone(),
            max_output_bytes,
        })?)),
        #[cfg(target_os = "linux")]
        "bubblewrap" => Ok(Arc::new(BubblewrapRuntime::new(BubblewrapOptions {
            snapshot_root: default_snapshot_root(&config.sandbox),
            max_output_bytes,
        })?)),
        other => Err(SandboxError::InvalidConfig(format!(
            "sandbox provider `{other}` is not available on this platform"
        ))),
    }
}

/// Sandbox policy derived from the configuration and the chosen hostname.
pub fn policy_from_config(config: &SandboxConfig, hostname: Option<String>) -> SandboxPolicy {
    SandboxPolicy {
        limits: SandboxLimits::from(&config.limits),
        hostname,
        network: config.network,
    }
}
