//! Command dispatch into the session's sandbox.

use crate::cwd::DirectoryTracker;
use crate::error::ShellError;
use crate::strategy::ExecutionStrategy;
use crate::types::CommandOutcome;
use crunchy_config::ShellConfig;
use crunchy_sandbox::{ProcessSpec, SandboxHandle, SandboxRuntime};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Runs command lines one at a time inside a single sandbox.
pub struct Dispatcher {
    runtime: Arc<dyn SandboxRuntime>,
    handle: SandboxHandle,
    strategy: Arc<dyn ExecutionStrategy>,
    shell_path: String,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        handle: SandboxHandle,
        strategy: Arc<dyn ExecutionStrategy>,
        shell: &ShellConfig,
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), shell.path.clone());
        Self {
            runtime,
            handle,
            strategy,
            shell_path: shell.shell_path.clone(),
            env,
            timeout: Duration::from_secs(shell.command_timeout_secs),
        }
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Process spec for a `<shell> -c <script>` invocation with a fresh id.
    fn process_spec(&self, script: String) -> ProcessSpec {
        let mut spec = ProcessSpec::new(vec![self.shell_path.clone(), "-c".to_string(), script]);
        spec.env = self.env.clone();
        spec.timeout = Some(self.timeout);
        spec
    }

    /// Execute one command line and reconcile the tracked directory.
    ///
    /// Start and wait failures surface as [`ShellError::Execution`]; a run
    /// longer than the configured limit is dropped, which kills the child,
    /// and surfaces as [`ShellError::Timeout`].
    pub async fn dispatch(
        &self,
        command: &str,
        tracker: &mut DirectoryTracker,
    ) -> Result<CommandOutcome, ShellError> {
        let prepared = self.strategy.prepare(command, tracker);
        let spec = self.process_spec(prepared.script.clone());
        debug!(
            "dispatching command (sandbox={}, exec_id={}, strategy={})",
            self.handle.name,
            spec.exec_id,
            self.strategy.name()
        );
        let run = self.runtime.run_command(&self.handle, spec);
        let result = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(
                    "command execution failed (sandbox={}, error={})",
                    self.handle.name, err
                );
                return Err(ShellError::Execution(err));
            }
            Err(_) => {
                warn!(
                    "command timed out (sandbox={}, timeout_secs={})",
                    self.handle.name,
                    self.timeout.as_secs()
                );
                return Err(ShellError::Timeout(self.timeout));
            }
        };
        let outcome = self.strategy.reconcile(&prepared, result, tracker);
        info!(
            "command finished (sandbox={}, exit_code={:?}, cwd={})",
            self.handle.name, outcome.exit_code, outcome.directory
        );
        Ok(outcome)
    }
}
