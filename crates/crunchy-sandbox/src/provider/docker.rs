//! Docker CLI-backed sandbox runtime.
//!
//! Each sandbox is a detached container kept alive with `sleep infinity`;
//! commands run through `docker exec`, and `docker rm -f` discards the
//! container together with its writable layer.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use uuid::Uuid;

use crate::provider::{
    DependencyReport, SandboxRegistry, SandboxRuntime, TerminalProcess, run_captured,
};
use crate::pty::{PtyCommand, PtyProcess};
use crate::{
    CommandResult, ImageHandle, ProcessSpec, SandboxError, SandboxHandle, SandboxPolicy,
    TerminalSize,
};

/// Runtime knobs shared by every container.
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Prefix for container names.
    pub name_prefix: String,
    /// Cap on captured bytes per output stream.
    pub max_output_bytes: usize,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            name_prefix: "crunchy".to_string(),
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Sandbox runtime driving the `docker` CLI.
#[derive(Debug)]
pub struct DockerRuntime {
    docker_path: PathBuf,
    options: DockerOptions,
    containers: SandboxRegistry<String>,
}

impl DockerRuntime {
    /// Create a runtime by resolving the docker binary.
    pub fn new(options: DockerOptions) -> Result<Self, SandboxError> {
        let docker_path = which::which("docker").map_err(|_| {
            SandboxError::DependencyMissing("docker CLI not found in PATH".to_string())
        })?;
        info!("docker runtime initialized (path={})", docker_path.display());
        Ok(Self::with_docker_path(docker_path, options))
    }

    /// Create a runtime around an explicit docker binary.
    pub fn with_docker_path(docker_path: impl Into<PathBuf>, options: DockerOptions) -> Self {
        Self {
            docker_path: docker_path.into(),
            options,
            containers: SandboxRegistry::default(),
        }
    }

    fn container_name(&self, id: Uuid) -> String {
        format!("{}-{}", self.options.name_prefix, id)
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandResult, SandboxError> {
        debug!("docker invocation (subcommand={:?})", args.first());
        let mut command = Command::new(&self.docker_path);
        command.args(&args);
        run_captured(command, self.options.max_output_bytes).await
    }

    /// Run a docker subcommand that must succeed.
    async fn docker_checked(&self, args: Vec<String>) -> Result<CommandResult, SandboxError> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let result = self.docker(args).await?;
        if result.status_code != Some(0) {
            return Err(SandboxError::ExecutionFailed(format!(
                "docker {subcommand} failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}

/// Arguments for `docker run` creating a long-lived sandbox container.
pub(crate) fn run_args(name: &str, image: &ImageHandle, policy: &SandboxPolicy) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--init".to_string(),
    ];
    if let Some(hostname) = &policy.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }
    if !policy.network {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    let limits = &policy.limits;
    if let Some(memory) = limits.memory_bytes {
        args.push("--memory".to_string());
        args.push(memory.to_string());
    }
    if let Some(cpus) = limits.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    if let Some(pids) = limits.pids {
        args.push("--pids-limit".to_string());
        args.push(pids.to_string());
    }
    if let Some(nofile) = limits.nofile {
        args.push("--ulimit".to_string());
        args.push(format!("nofile={nofile}:{nofile}"));
    }
    if let Some(cpu_seconds) = limits.cpu_seconds {
        args.push("--ulimit".to_string());
        args.push(format!("cpu={cpu_seconds}:{cpu_seconds}"));
    }
    args.push(image.reference.clone());
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

/// Arguments for `docker exec` running one process in a container.
pub(crate) fn exec_args(name: &str, spec: &ProcessSpec, terminal: bool) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if terminal {
        args.push("-it".to_string());
    }
    if let Some(cwd) = &spec.cwd {
        args.push("-w".to_string());
        args.push(cwd.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(name.to_string());
    // Killing the `docker exec` client leaves the process running in the
    // container, so captured runs carry their own deadline.
    if let (false, Some(limit)) = (terminal, spec.timeout) {
        args.push("timeout".to_string());
        args.push("-s".to_string());
        args.push("KILL".to_string());
        args.push(limit.as_secs().max(1).to_string());
    }
    args.extend(spec.args.iter().cloned());
    args
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn pull(&self, reference: &str) -> Result<ImageHandle, SandboxError> {
        info!("pulling image (reference={reference})");
        self.docker_checked(vec!["pull".to_string(), reference.to_string()])
            .await?;
        let inspect = self
            .docker_checked(vec![
                "image".to_string(),
                "inspect".to_string(),
                "--format".to_string(),
                "{{.Id}}".to_string(),
                reference.to_string(),
            ])
            .await?;
        let id = inspect.stdout.trim().to_string();
        info!("image ready (reference={reference}, id={id})");
        Ok(ImageHandle {
            reference: reference.to_string(),
            id,
        })
    }

    async fn create(
        &self,
        id: Uuid,
        image: &ImageHandle,
        policy: &SandboxPolicy,
    ) -> Result<SandboxHandle, SandboxError> {
        let name = self.container_name(id);
        self.containers.register(id, name.clone())?;
        if let Err(err) = self.docker_checked(run_args(&name, image, policy)).await {
            self.containers.forget(id);
            return Err(err);
        }
        info!("docker sandbox created (session_id={id}, name={name})");
        Ok(SandboxHandle { id, name })
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<CommandResult, SandboxError> {
        let name = self.containers.get(handle.id)?;
        let _exec = self.containers.begin_exec(&spec.exec_id)?;
        debug!(
            "docker exec (session_id={}, exec_id={}, args_len={})",
            handle.id,
            spec.exec_id,
            spec.args.len()
        );
        let result = self.docker(exec_args(&name, &spec, false)).await?;
        // Exit 125 is the CLI itself failing (container gone, bad cwd).
        if matches!(result.status_code, Some(125)) {
            return Err(SandboxError::ExecutionFailed(result.stderr.trim().to_string()));
        }
        Ok(result)
    }

    async fn spawn_terminal(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
        size: TerminalSize,
    ) -> Result<Arc<dyn TerminalProcess>, SandboxError> {
        let name = self.containers.get(handle.id)?;
        let exec = self.containers.begin_exec(&spec.exec_id)?;
        let command = PtyCommand {
            program: self.docker_path.display().to_string(),
            args: exec_args(&name, &spec, true),
            env: Default::default(),
            cwd: None,
        };
        let process = PtyProcess::spawn(command, size, Some(exec))?;
        info!(
            "docker terminal attached (session_id={}, exec_id={})",
            handle.id, spec.exec_id
        );
        Ok(Arc::new(process))
    }

    async fn destroy(&self, handle: SandboxHandle) {
        if self.containers.forget(handle.id).is_none() {
            warn!("destroying unknown docker sandbox (session_id={})", handle.id);
        }
        match self
            .docker(vec!["rm".to_string(), "-f".to_string(), handle.name.clone()])
            .await
        {
            Ok(result) if result.status_code == Some(0) => {
                info!(
                    "docker sandbox destroyed (session_id={}, name={})",
                    handle.id, handle.name
                );
            }
            Ok(result) => warn!(
                "docker rm failed (name={}, stderr={})",
                handle.name,
                result.stderr.trim()
            ),
            Err(err) => warn!("docker rm failed (name={}, error={err})", handle.name),
        }
    }

    fn dependency_report(&self) -> DependencyReport {
        let mut report = DependencyReport::default();
        if !self.docker_path.exists() {
            report.errors.push(format!(
                "docker CLI not found at {}",
                self.docker_path.display()
            ));
        }
        if !std::path::Path::new("/var/run/docker.sock").exists() {
            report.warnings.push(
                "docker socket /var/run/docker.sock not found; DOCKER_HOST must point at a daemon"
                    .to_string(),
            );
        }
        report
    }
}
