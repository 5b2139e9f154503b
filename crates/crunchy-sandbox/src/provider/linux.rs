//! Bubblewrap-based sandbox runtime for Linux.
//!
//! The `host` image shares the host's system directories read-only and gives
//! each session private writable `/root`, `/tmp` and `/home`. Any other image
//! reference names a rootfs directory that is overlaid with a per-session
//! upper layer.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::process::Command;
use uuid::Uuid;

use crate::provider::{
    DependencyReport, SandboxRegistry, SandboxRuntime, TerminalProcess, bind_if_exists,
    run_captured,
};
use crate::pty::{PtyCommand, PtyProcess};
use crate::{
    CommandResult, ImageHandle, ProcessSpec, SandboxError, SandboxHandle, SandboxLimits,
    SandboxPolicy, TerminalSize,
};

/// Image reference that selects the host's own system directories.
pub const HOST_IMAGE: &str = "host";

/// Runtime knobs shared by every bubblewrap sandbox.
#[derive(Debug, Clone)]
pub struct BubblewrapOptions {
    /// Directory holding one snapshot directory per live session.
    pub snapshot_root: PathBuf,
    /// Cap on captured bytes per output stream.
    pub max_output_bytes: usize,
}

/// Where a sandbox gets its root filesystem from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RootFs {
    Host,
    Directory(PathBuf),
}

/// Per-session state kept while the sandbox is alive.
#[derive(Debug, Clone)]
struct BubblewrapSandbox {
    rootfs: RootFs,
    snapshot: PathBuf,
    policy: SandboxPolicy,
}

/// Bubblewrap-backed sandbox runtime.
#[derive(Debug)]
pub struct BubblewrapRuntime {
    /// Path to the bwrap executable.
    bwrap_path: PathBuf,
    options: BubblewrapOptions,
    sandboxes: SandboxRegistry<BubblewrapSandbox>,
}

impl BubblewrapRuntime {
    /// Create a new bubblewrap runtime by resolving the bwrap binary.
    pub fn new(options: BubblewrapOptions) -> Result<Self, SandboxError> {
        let bwrap_path = which::which("bwrap").map_err(|_| {
            SandboxError::DependencyMissing("bubblewrap (bwrap) not found in PATH".to_string())
        })?;
        info!(
            "bubblewrap runtime initialized (path={}, snapshot_root={})",
            bwrap_path.display(),
            options.snapshot_root.display()
        );
        Ok(Self::with_bwrap_path(bwrap_path, options))
    }

    /// Create a runtime around an explicit bwrap binary.
    pub fn with_bwrap_path(bwrap_path: impl Into<PathBuf>, options: BubblewrapOptions) -> Self {
        Self {
            bwrap_path: bwrap_path.into(),
            options,
            sandboxes: SandboxRegistry::default(),
        }
    }

    /// Build the bubblewrap argument list for one process.
    fn build_args(
        &self,
        sandbox: &BubblewrapSandbox,
        spec: &ProcessSpec,
        terminal: bool,
    ) -> Result<Vec<String>, SandboxError> {
        if spec.args.is_empty() {
            return Err(SandboxError::InvalidConfig(
                "process spec has no program".to_string(),
            ));
        }
        let mut bwrap_args: Vec<String> = vec!["--die-with-parent".to_string()];
        // A new session would detach the process from the controlling PTY.
        if !terminal {
            bwrap_args.push("--new-session".to_string());
        }
        bwrap_args.extend(
            [
                "--unshare-user",
                "--uid",
                "0",
                "--gid",
                "0",
                "--unshare-ipc",
                "--unshare-uts",
                "--unshare-pid",
            ]
            .map(String::from),
        );
        if !sandbox.policy.network {
            bwrap_args.push("--unshare-net".to_string());
        }
        if let Some(hostname) = &sandbox.policy.hostname {
            bwrap_args.push("--hostname".to_string());
            bwrap_args.push(hostname.clone());
        }

        match &sandbox.rootfs {
            RootFs::Directory(rootfs) => {
                bwrap_args.push("--overlay-src".to_string());
                bwrap_args.push(rootfs.display().to_string());
                bwrap_args.push("--overlay".to_string());
                bwrap_args.push(sandbox.snapshot.join("upper").display().to_string());
                bwrap_args.push(sandbox.snapshot.join("work").display().to_string());
                bwrap_args.push("/".to_string());
            }
            RootFs::Host => {
                for (src, dst) in base_system_mounts() {
                    bind_if_exists(&mut bwrap_args, "--ro-bind", &src, &dst);
                }
                append_etc_mounts(&mut bwrap_args);
                for dir in SESSION_DIRS {
                    bwrap_args.push("--bind".to_string());
                    bwrap_args.push(sandbox.snapshot.join(dir).display().to_string());
                    bwrap_args.push(format!("/{dir}"));
                }
                bwrap_args.push("--dir".to_string());
                bwrap_args.push("/var/log".to_string());
            }
        }

        bwrap_args.extend(["--proc", "/proc", "--dev", "/dev"].map(String::from));

        if let Some(cwd) = &spec.cwd {
            bwrap_args.push("--chdir".to_string());
            bwrap_args.push(cwd.clone());
        }

        bwrap_args.push("--clearenv".to_string());
        for (key, value) in &spec.env {
            bwrap_args.push("--setenv".to_string());
            bwrap_args.push(key.clone());
            bwrap_args.push(value.clone());
        }

        bwrap_args.push("--".to_string());
        bwrap_args.extend(spec.args.iter().cloned());
        Ok(bwrap_args)
    }

    /// Produce a dependency report for Linux bubblewrap requirements.
    fn dependency_report_linux(&self) -> DependencyReport {
        let mut report = DependencyReport::default();
        if !self.bwrap_path.exists() {
            report.errors.push(format!(
                "bubblewrap (bwrap) not found at {}",
                self.bwrap_path.display()
            ));
        }
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            report
                .warnings
                .push("cgroup v2 not detected; resource limits rely on rlimits only".to_string());
        }
        report
    }
}

/// Writable per-session directories for the host image.
const SESSION_DIRS: [&str; 3] = ["root", "tmp", "home"];

#[async_trait]
impl SandboxRuntime for BubblewrapRuntime {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    async fn pull(&self, reference: &str) -> Result<ImageHandle, SandboxError> {
        if reference == HOST_IMAGE {
            return Ok(ImageHandle {
                reference: HOST_IMAGE.to_string(),
                id: HOST_IMAGE.to_string(),
            });
        }
        let path = Path::new(reference);
        if !path.is_dir() {
            return Err(SandboxError::InvalidConfig(format!(
                "bubblewrap image must be `{HOST_IMAGE}` or an existing rootfs directory: {reference}"
            )));
        }
        let resolved = fs::canonicalize(path)?;
        info!(
            "bubblewrap rootfs resolved (reference={reference}, path={})",
            resolved.display()
        );
        Ok(ImageHandle {
            reference: reference.to_string(),
            id: resolved.display().to_string(),
        })
    }

    async fn create(
        &self,
        id: Uuid,
        image: &ImageHandle,
        policy: &SandboxPolicy,
    ) -> Result<SandboxHandle, SandboxError> {
        let rootfs = if image.id == HOST_IMAGE {
            RootFs::Host
        } else {
            RootFs::Directory(PathBuf::from(&image.id))
        };
        let snapshot = self.options.snapshot_root.join(id.to_string());
        let sandbox = BubblewrapSandbox {
            rootfs,
            snapshot: snapshot.clone(),
            policy: policy.clone(),
        };
        self.sandboxes.register(id, sandbox.clone())?;
        if policy.limits.pids.is_some() {
            warn!("bubblewrap cannot limit pids per sandbox, ignoring (session_id={id})");
        }

        let dirs: &[&str] = match sandbox.rootfs {
            RootFs::Host => &SESSION_DIRS,
            RootFs::Directory(_) => &["upper", "work"],
        };
        for dir in dirs {
            if let Err(err) = tokio::fs::create_dir_all(snapshot.join(dir)).await {
                self.sandboxes.forget(id);
                return Err(SandboxError::Io(err));
            }
        }
        info!(
            "bubblewrap sandbox created (session_id={id}, snapshot={})",
            snapshot.display()
        );
        Ok(SandboxHandle {
            id,
            name: format!("bwrap-{id}"),
        })
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<CommandResult, SandboxError> {
        let sandbox = self.sandboxes.get(handle.id)?;
        let _exec = self.sandboxes.begin_exec(&spec.exec_id)?;
        debug!(
            "bubblewrap run (session_id={}, exec_id={}, args_len={})",
            handle.id,
            spec.exec_id,
            spec.args.len()
        );
        let mut cmd = Command::new(&self.bwrap_path);
        cmd.args(self.build_args(&sandbox, &spec, false)?);
        cmd.env_clear();

        let limits = sandbox.policy.limits.clone();
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&limits));
        }

        let result = run_captured(cmd, self.options.max_output_bytes).await?;
        if result.status_code.is_none() {
            warn!(
                "bubblewrap command terminated by signal (exec_id={})",
                spec.exec_id
            );
        }
        Ok(result)
    }

    async fn spawn_terminal(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
        size: TerminalSize,
    ) -> Result<Arc<dyn TerminalProcess>, SandboxError> {
        let sandbox = self.sandboxes.get(handle.id)?;
        let exec = self.sandboxes.begin_exec(&spec.exec_id)?;
        let command = PtyCommand {
            program: self.bwrap_path.display().to_string(),
            args: self.build_args(&sandbox, &spec, true)?,
            env: Default::default(),
            cwd: None,
        };
        let process = PtyProcess::spawn(command, size, Some(exec))?;
        info!(
            "bubblewrap terminal attached (session_id={}, exec_id={})",
            handle.id, spec.exec_id
        );
        Ok(Arc::new(process))
    }

    async fn destroy(&self, handle: SandboxHandle) {
        let Some(sandbox) = self.sandboxes.forget(handle.id) else {
            warn!(
                "destroying unknown bubblewrap sandbox (session_id={})",
                handle.id
            );
            return;
        };
        match tokio::fs::remove_dir_all(&sandbox.snapshot).await {
            Ok(()) => info!("bubblewrap sandbox destroyed (session_id={})", handle.id),
            Err(err) => warn!(
                "failed to remove sandbox snapshot (path={}, error={err})",
                sandbox.snapshot.display()
            ),
        }
    }

    fn dependency_report(&self) -> DependencyReport {
        self.dependency_report_linux()
    }
}

/// Per-process rlimits derived from the sandbox limits.
///
/// `pids` has no rlimit equivalent: `RLIMIT_NPROC` counts every process of
/// the host user, so it would be shared by all sessions.
pub(crate) fn rlimit_settings(limits: &SandboxLimits) -> Vec<(libc::__rlimit_resource_t, u64)> {
    [
        (libc::RLIMIT_CPU, limits.cpu_seconds),
        (libc::RLIMIT_AS, limits.memory_bytes),
        (libc::RLIMIT_NOFILE, limits.nofile),
    ]
    .into_iter()
    .filter_map(|(resource, value)| value.map(|value| (resource, value)))
    .collect()
}

/// Apply rlimits based on configured sandbox limits.
pub(crate) fn apply_rlimits(limits: &SandboxLimits) -> Result<(), std::io::Error> {
    for (resource, value) in rlimit_settings(limits) {
        let rlim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        let result = unsafe { libc::setrlimit(resource, &rlim) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Host directories shared read-only with the `host` image.
fn base_system_mounts() -> Vec<(PathBuf, PathBuf)> {
    [
        ("/usr", "/usr"),
        ("/lib", "/lib"),
        ("/lib64", "/lib64"),
        ("/bin", "/bin"),
        ("/sbin", "/sbin"),
        ("/opt", "/opt"),
    ]
    .into_iter()
    .map(|(src, dst)| (PathBuf::from(src), PathBuf::from(dst)))
    .collect()
}

/// Append the minimal /etc needed for a login-looking shell.
fn append_etc_mounts(args: &mut Vec<String>) {
    args.push("--dir".to_string());
    args.push("/etc".to_string());

    let file_mounts = [
        "/etc/hosts",
        "/etc/nsswitch.conf",
        "/etc/passwd",
        "/etc/group",
        "/etc/ld.so.cache",
        "/etc/os-release",
        "/etc/bash.bashrc",
    ];
    for path in file_mounts {
        bind_if_exists(args, "--ro-bind", Path::new(path), Path::new(path));
    }

    append_resolv_conf_mount(args);

    for path in ["/etc/ssl", "/etc/alternatives"] {
        bind_if_exists(args, "--ro-bind", Path::new(path), Path::new(path));
    }
}

fn append_resolv_conf_mount(args: &mut Vec<String>) {
    let resolv_path = Path::new("/etc/resolv.conf");
    if let Ok(resolved) = fs::canonicalize(resolv_path)
        && resolved.as_path() != resolv_path
    {
        bind_if_exists(args, "--ro-bind", &resolved, resolv_path);
        return;
    }
    bind_if_exists(args, "--ro-bind", resolv_path, resolv_path);
}
