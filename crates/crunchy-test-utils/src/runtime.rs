use async_trait::async_trait;
use crunchy_sandbox::{
    CommandResult, ImageHandle, ProcessSpec, SandboxError, SandboxHandle, SandboxPolicy,
    SandboxRegistry, SandboxRuntime, TerminalProcess, TerminalSize,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::FakeTerminal;

/// Directories that exist in every fake sandbox.
const KNOWN_DIRS: &[&str] = &["/", "/root", "/tmp", "/var", "/var/log", "/etc", "/home"];

/// One call made against the fake runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Pull(String),
    Create(Uuid),
    Run { args: Vec<String>, cwd: Option<String> },
    SpawnTerminal { args: Vec<String>, size: TerminalSize },
    Destroy(Uuid),
}

/// Scripted stand-in for a container runtime.
///
/// `run_command` understands `bash -c` scripts made of `;`-separated
/// `cd`, `pwd`, `echo` (with `$(pwd)` substitution), `true` and `false`
/// segments, starting from `/` every time. Anything else is "not found"
/// unless a canned response was registered for it.
#[derive(Default)]
pub struct FakeRuntime {
    sandboxes: SandboxRegistry<()>,
    calls: Mutex<Vec<RuntimeCall>>,
    responses: Mutex<HashMap<String, CommandResult>>,
    create_failure: Mutex<Option<String>>,
    exec_failure: Mutex<Option<String>>,
    exec_delay: Mutex<Option<Duration>>,
    terminal_prompt: Mutex<String>,
    terminals: Mutex<Vec<Arc<FakeTerminal>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a single script segment with canned output.
    pub fn with_response(self, segment: &str, stdout: &str, stderr: &str, status: i32) -> Self {
        self.responses.lock().insert(
            segment.to_string(),
            CommandResult {
                status_code: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
        self
    }

    /// Make sandbox creation fail.
    pub fn with_create_failure(self, message: &str) -> Self {
        *self.create_failure.lock() = Some(message.to_string());
        self
    }

    /// Make every execution fail to start.
    pub fn with_exec_failure(self, message: &str) -> Self {
        *self.exec_failure.lock() = Some(message.to_string());
        self
    }

    /// Delay every execution, e.g. to exercise timeouts.
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        *self.exec_delay.lock() = Some(delay);
        self
    }

    /// Initial output of spawned terminals.
    pub fn with_terminal_prompt(self, prompt: &str) -> Self {
        *self.terminal_prompt.lock() = prompt.to_string();
        self
    }

    /// Everything the runtime was asked to do, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().clone()
    }

    /// Scripts passed to `run_command`, in order.
    pub fn scripts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Run { args, .. } => args.last().cloned(),
                _ => None,
            })
            .collect()
    }

    /// Terminals handed out by `spawn_terminal`.
    pub fn terminals(&self) -> Vec<Arc<FakeTerminal>> {
        self.terminals.lock().clone()
    }

    /// Number of sandboxes currently alive.
    pub fn live_sandboxes(&self) -> usize {
        self.sandboxes.len()
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().push(call);
    }

    /// Run a script through the tiny shell emulation.
    fn emulate(&self, script: &str) -> CommandResult {
        let mut cwd = "/".to_string();
        let mut result = CommandResult {
            status_code: Some(0),
            ..Default::default()
        };
        for segment in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(canned) = self.responses.lock().get(segment) {
                result.stdout.push_str(&canned.stdout);
                result.stderr.push_str(&canned.stderr);
                result.status_code = canned.status_code;
                continue;
            }
            let words = shell_words::split(segment)
                .unwrap_or_else(|_| segment.split_whitespace().map(String::from).collect());
            let status = match words.first().map(String::as_str) {
                Some("cd") => {
                    let target = words.get(1).map(String::as_str).unwrap_or("~");
                    let next = match target {
                        "~" => "/root".to_string(),
                        "-" => cwd.clone(),
                        _ => match target.strip_prefix("~/") {
                            Some(rest) => resolve("/root", rest),
                            None => resolve(&cwd, target),
                        },
                    };
                    if KNOWN_DIRS.contains(&next.as_str()) {
                        cwd = next;
                        0
                    } else {
                        result
                            .stderr
                            .push_str(&format!("bash: cd: {target}: No such file or directory\n"));
                        1
                    }
                }
                Some("pwd") => {
                    result.stdout.push_str(&format!("{cwd}\n"));
                    0
                }
                Some("echo") => {
                    let text = words[1..].join(" ").replace("$(pwd)", &cwd);
                    result.stdout.push_str(&format!("{text}\n"));
                    0
                }
                Some("true") => 0,
                Some("false") => 1,
                Some(other) => {
                    result
                        .stderr
                        .push_str(&format!("bash: {other}: command not found\n"));
                    127
                }
                None => 0,
            };
            result.status_code = Some(status);
        }
        result
    }
}

/// Lexically resolve `target` against `cwd`.
fn resolve(cwd: &str, target: &str) -> String {
    let joined = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("{cwd}/{target}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn pull(&self, reference: &str) -> Result<ImageHandle, SandboxError> {
        self.record(RuntimeCall::Pull(reference.to_string()));
        Ok(ImageHandle {
            reference: reference.to_string(),
            id: format!("fake:{reference}"),
        })
    }

    async fn create(
        &self,
        id: Uuid,
        _image: &ImageHandle,
        _policy: &SandboxPolicy,
    ) -> Result<SandboxHandle, SandboxError> {
        self.record(RuntimeCall::Create(id));
        if let Some(message) = self.create_failure.lock().clone() {
            return Err(SandboxError::ExecutionFailed(message));
        }
        self.sandboxes.register(id, ())?;
        Ok(SandboxHandle {
            id,
            name: format!("fake-{id}"),
        })
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
    ) -> Result<CommandResult, SandboxError> {
        self.sandboxes.get(handle.id)?;
        let _exec = self.sandboxes.begin_exec(&spec.exec_id)?;
        self.record(RuntimeCall::Run {
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
        });
        let delay = *self.exec_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.exec_failure.lock().clone() {
            return Err(SandboxError::ExecutionFailed(message));
        }
        let script = spec.args.last().cloned().unwrap_or_default();
        Ok(self.emulate(&script))
    }

    async fn spawn_terminal(
        &self,
        handle: &SandboxHandle,
        spec: ProcessSpec,
        size: TerminalSize,
    ) -> Result<Arc<dyn TerminalProcess>, SandboxError> {
        self.sandboxes.get(handle.id)?;
        self.record(RuntimeCall::SpawnTerminal {
            args: spec.args.clone(),
            size,
        });
        if let Some(message) = self.exec_failure.lock().clone() {
            return Err(SandboxError::ExecutionFailed(message));
        }
        let prompt = self.terminal_prompt.lock().clone();
        let terminal = Arc::new(FakeTerminal::new(size, &prompt));
        self.terminals.lock().push(terminal.clone());
        Ok(terminal)
    }

    async fn destroy(&self, handle: SandboxHandle) {
        self.record(RuntimeCall::Destroy(handle.id));
        self.sandboxes.forget(handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::{FakeRuntime, resolve};
    use pretty_assertions::assert_eq;

    #[test]
    fn resolve_handles_relative_and_parent_segments() {
        assert_eq!(resolve("/var", "log"), "/var/log");
        assert_eq!(resolve("/var/log", ".."), "/var");
        assert_eq!(resolve("/", "../.."), "/");
        assert_eq!(resolve("/tmp", "/etc/"), "/etc");
    }

    #[test]
    fn emulation_tracks_cd_within_one_script() {
        let runtime = FakeRuntime::new();
        let result = runtime.emulate("cd /var; cd log; pwd; echo __CWD__t:$(pwd)__END__");
        assert_eq!(result.stdout, "/var/log\n__CWD__t:/var/log__END__\n");
        assert_eq!(result.status_code, Some(0));
    }

    #[test]
    fn unknown_commands_fail_like_bash() {
        let runtime = FakeRuntime::new();
        let result = runtime.emulate("cd /; nmap");
        assert_eq!(result.stderr, "bash: nmap: command not found\n");
        assert_eq!(result.status_code, Some(127));

        let result = runtime.emulate("cd /nope");
        assert_eq!(
            result.stderr,
            "bash: cd: /nope: No such file or directory\n"
        );
    }
}
