//! Execution strategies: how a command line becomes a sandbox script and how
//! its result feeds back into the directory tracker.

use crate::cwd::DirectoryTracker;
use crate::marker::DirectoryMarker;
use crate::types::CommandOutcome;
use crunchy_config::ExecutionStrategyKind;
use crunchy_sandbox::CommandResult;
use std::sync::Arc;

/// Script ready to hand to the sandbox shell.
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub script: String,
    /// Marker embedded in the script, when the strategy uses one.
    pub marker: Option<DirectoryMarker>,
}

/// One rule for keeping the logical directory in sync with the sandbox.
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the script for `command`, updating the tracker if the strategy
    /// predicts directory changes up front.
    fn prepare(&self, command: &str, tracker: &mut DirectoryTracker) -> PreparedCommand;

    /// Turn the raw sandbox result into the outcome shown to the peer.
    fn reconcile(
        &self,
        prepared: &PreparedCommand,
        result: CommandResult,
        tracker: &mut DirectoryTracker,
    ) -> CommandOutcome;
}

/// Predicts `cd` locally and runs every command from the tracked directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExplicitDirectoryStrategy;

impl ExecutionStrategy for ExplicitDirectoryStrategy {
    fn name(&self) -> &'static str {
        "explicit_directory"
    }

    fn prepare(&self, command: &str, tracker: &mut DirectoryTracker) -> PreparedCommand {
        // The command runs from where the peer typed it; the prediction only
        // applies to the next one.
        let script = format!("cd {}; {command}", shell_words::quote(tracker.current()));
        tracker.observe_command(command);
        PreparedCommand {
            script,
            marker: None,
        }
    }

    fn reconcile(
        &self,
        _prepared: &PreparedCommand,
        result: CommandResult,
        tracker: &mut DirectoryTracker,
    ) -> CommandOutcome {
        CommandOutcome {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.status_code,
            directory: tracker.current().to_string(),
        }
    }
}

/// Lets the sandbox report its final directory through an output marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerRecoveryStrategy;

impl ExecutionStrategy for MarkerRecoveryStrategy {
    fn name(&self) -> &'static str {
        "marker_recovery"
    }

    fn prepare(&self, command: &str, tracker: &mut DirectoryTracker) -> PreparedCommand {
        let marker = DirectoryMarker::generate();
        let script = marker.wrap(&shell_words::quote(tracker.current()), command);
        PreparedCommand {
            script,
            marker: Some(marker),
        }
    }

    fn reconcile(
        &self,
        prepared: &PreparedCommand,
        result: CommandResult,
        tracker: &mut DirectoryTracker,
    ) -> CommandOutcome {
        let stdout = match &prepared.marker {
            Some(marker) => {
                let scan = marker.extract(&result.stdout);
                if let Some(directory) = scan.directory {
                    tracker.apply_report(&directory);
                }
                scan.output
            }
            None => result.stdout,
        };
        CommandOutcome {
            stdout,
            stderr: result.stderr,
            exit_code: result.status_code,
            directory: tracker.current().to_string(),
        }
    }
}

/// Strategy implementation for a configured kind.
pub fn strategy_for(kind: ExecutionStrategyKind) -> Arc<dyn ExecutionStrategy> {
    match kind {
        ExecutionStrategyKind::ExplicitDirectory => Arc::new(ExplicitDirectoryStrategy),
        ExecutionStrategyKind::MarkerRecovery => Arc::new(MarkerRecoveryStrategy),
    }
}
