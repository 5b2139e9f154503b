//! Sandbox runtime traits and shared helpers.

use async_trait::async_trait;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::types::{
    CommandResult, ExecId, ImageHandle, ProcessSpec, SandboxHandle, SandboxPolicy, TerminalSize,
};

pub mod docker;
#[cfg(target_os = "linux")]
pub mod linux;

/// Report of missing dependencies for a sandbox runtime.
#[derive(Debug, Default)]
pub struct DependencyReport {
    /// Hard errors preventing runtime use.
    pub errors: Vec<String>,
    /// Warnings that may degrade functionality.
    pub warnings: Vec<String>,
}

/// Sandbox runtime interface.
///
/// One runtime client is shared by every session; each session owns exactly
/// one sandbox created through it.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Short runtime name used in logs.
    fn name(&self) -> &'static str;

    /// Resolve an image reference into a handle sandboxes can be created from.
    async fn pull(&self, reference: &str) -> Result<ImageHandle, SandboxError>;

    /// Create a fresh sandbox for a session.
    ///
    /// Fails with [`SandboxError::SandboxExists`] while a sandbox with the same
    /// id is still alive.
    async fn create(
        &self,
        id: Uuid,
        image: &ImageHandle,
        policy: &SandboxPolicy,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Start a process, wait for it, and capture its output.
    async fn run_command(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<CommandResult, SandboxError>;

    /// Start a process attached to a pseudo-terminal.
    async fn spawn_terminal(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
        size: TerminalSize,
    ) -> Result<Arc<dyn TerminalProcess>, SandboxError>;

    /// Tear the sandbox down and release its snapshot.
    async fn destroy(&self, handle: SandboxHandle);

    /// Return a dependency report for the runtime.
    fn dependency_report(&self) -> DependencyReport {
        DependencyReport::default()
    }
}

/// A process running on a pseudo-terminal inside a sandbox.
#[async_trait]
pub trait TerminalProcess: Send + Sync {
    /// Queue bytes for the terminal input.
    fn write(&self, data: &[u8]) -> Result<(), SandboxError>;

    /// Next chunk of terminal output, or `None` once the terminal closed.
    async fn read(&self) -> Option<Vec<u8>>;

    /// Change the terminal window size.
    fn resize(&self, size: TerminalSize) -> Result<(), SandboxError>;

    /// Kill the process.
    fn kill(&self) -> Result<(), SandboxError>;

    /// Wait for the process to exit and return its status code.
    async fn wait(&self) -> Option<i32>;
}

/// Bookkeeping for live sandboxes and in-flight executions.
#[derive(Debug)]
pub struct SandboxRegistry<T> {
    sandboxes: RwLock<HashMap<Uuid, T>>,
    execs: Arc<Mutex<HashSet<ExecId>>>,
}

impl<T> Default for SandboxRegistry<T> {
    fn default() -> Self {
        Self {
            sandboxes: RwLock::new(HashMap::new()),
            execs: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<T: Clone> SandboxRegistry<T> {
    /// Record a new live sandbox; an id can only be live once.
    pub fn register(&self, id: Uuid, state: T) -> Result<(), SandboxError> {
        let mut sandboxes = self.sandboxes.write();
        if sandboxes.contains_key(&id) {
            return Err(SandboxError::SandboxExists(id));
        }
        sandboxes.insert(id, state);
        Ok(())
    }

    /// Look up the state for a live sandbox.
    pub fn get(&self, id: Uuid) -> Result<T, SandboxError> {
        self.sandboxes
            .read()
            .get(&id)
            .cloned()
            .ok_or(SandboxError::UnknownSandbox(id))
    }

    /// Forget a sandbox so its id may be used again.
    pub fn forget(&self, id: Uuid) -> Option<T> {
        self.sandboxes.write().remove(&id)
    }

    /// Number of live sandboxes.
    pub fn len(&self) -> usize {
        self.sandboxes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim an execution id until the returned guard is dropped.
    pub fn begin_exec(&self, exec_id: &ExecId) -> Result<ExecGuard, SandboxError> {
        let mut execs = self.execs.lock();
        if !execs.insert(exec_id.clone()) {
            return Err(SandboxError::ExecConflict(exec_id.to_string()));
        }
        Ok(ExecGuard {
            execs: Arc::clone(&self.execs),
            exec_id: exec_id.clone(),
        })
    }
}

/// Releases an execution id when dropped.
#[derive(Debug)]
pub struct ExecGuard {
    execs: Arc<Mutex<HashSet<ExecId>>>,
    exec_id: ExecId,
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        self.execs.lock().remove(&self.exec_id);
    }
}

/// Spawn a prepared host command and capture its output.
///
/// The child is killed if the returned future is dropped before it exits.
pub async fn run_captured(
    mut command: Command,
    max_output_bytes: usize,
) -> Result<CommandResult, SandboxError> {
    command.stdin(std::process::Stdio::null());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(SandboxError::Io)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = stream_child_output(stdout, stderr, max_output_bytes).await?;
    let status = child.wait().await.map_err(SandboxError::Io)?;

    Ok(CommandResult {
        status_code: status.code(),
        stdout,
        stderr,
    })
}

/// Drain child stdout/stderr concurrently, keeping at most `limit` bytes of each.
pub async fn stream_child_output(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    limit: usize,
) -> Result<(String, String), SandboxError> {
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let mut stdout_reader = stdout.map(tokio::io::BufReader::new);
    let mut stderr_reader = stderr.map(tokio::io::BufReader::new);

    let mut stdout_done = stdout_reader.is_none();
    let mut stderr_done = stderr_reader.is_none();

    let mut stdout_chunk = vec![0u8; 8192];
    let mut stderr_chunk = vec![0u8; 8192];

    while !stdout_done || !stderr_done {
        tokio::select! {
            read = async {
                if let Some(reader) = stdout_reader.as_mut() {
                    reader.read(&mut stdout_chunk).await
                } else {
                    Ok(0)
                }
            }, if !stdout_done => {
                let read = read.map_err(SandboxError::Io)?;
                if read == 0 {
                    stdout_done = true;
                } else {
                    append_capped(&mut stdout_buf, &stdout_chunk[..read], limit);
                }
            }
            read = async {
                if let Some(reader) = stderr_reader.as_mut() {
                    reader.read(&mut stderr_chunk).await
                } else {
                    Ok(0)
                }
            }, if !stderr_done => {
                let read = read.map_err(SandboxError::Io)?;
                if read == 0 {
                    stderr_done = true;
                } else {
                    append_capped(&mut stderr_buf, &stderr_chunk[..read], limit);
                }
            }
        }
    }

    Ok((
        String::from_utf8_lossy(&stdout_buf).into_owned(),
        String::from_utf8_lossy(&stderr_buf).into_owned(),
    ))
}

/// Append a chunk without letting the buffer grow past `limit`.
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    let room = limit.saturating_sub(buf.len());
    if room < chunk.len() {
        debug!(
            "captured output truncated (limit={}, dropped={})",
            limit,
            chunk.len() - room
        );
    }
    buf.extend_from_slice(&chunk[..room.min(chunk.len())]);
}

/// Add bind mount args if the source exists.
pub fn bind_if_exists(args: &mut Vec<String>, flag: &str, source: &Path, target: &Path) {
    if source.exists() {
        args.push(flag.to_string());
        args.push(source.display().to_string());
        args.push(target.display().to_string());
    }
}
