//! Host pseudo-terminal adapter for interactive sandbox processes.
//!
//! The blocking PTY handles live on dedicated threads; tokio channels bridge
//! them to the async session task.

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use tokio::sync::{mpsc, watch};

use crate::error::SandboxError;
use crate::provider::{ExecGuard, TerminalProcess};
use crate::types::TerminalSize;

/// Output chunks buffered between the reader thread and the session.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Command line for a process started on a host PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

/// A child process attached to a host pseudo-terminal.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    output: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    exit: watch::Receiver<Option<i32>>,
}

impl PtyProcess {
    /// Open a PTY of the given size and spawn the command on it.
    ///
    /// `exec` stays claimed until the child exits.
    pub fn spawn(
        command: PtyCommand,
        size: TerminalSize,
        exec: Option<ExecGuard>,
    ) -> Result<Self, SandboxError> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|err| SandboxError::ExecutionFailed(format!("failed to open pty: {err}")))?;

        let mut builder = CommandBuilder::new(&command.program);
        for arg in &command.args {
            builder.arg(arg);
        }
        for (key, value) in &command.env {
            builder.env(key, value);
        }
        if let Some(cwd) = &command.cwd {
            builder.cwd(cwd);
        }

        let mut child = pair.slave.spawn_command(builder).map_err(|err| {
            SandboxError::ExecutionFailed(format!("failed to spawn {}: {err}", command.program))
        })?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SandboxError::ExecutionFailed(format!("pty reader: {err}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SandboxError::ExecutionFailed(format!("pty writer: {err}")))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        std::thread::spawn(move || pump_output(reader, output_tx));

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || pump_input(writer, input_rx));

        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) if status.signal().is_some() => -1,
                Ok(status) => status.exit_code() as i32,
                Err(err) => {
                    warn!("failed to wait for pty child: {err}");
                    -1
                }
            };
            drop(exec);
            debug!("pty child exited (code={code})");
            let _ = exit_tx.send(Some(code));
        });

        debug!(
            "pty process spawned (program={}, cols={}, rows={})",
            command.program, size.cols, size.rows
        );
        Ok(Self {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input: input_tx,
            output: tokio::sync::Mutex::new(output_rx),
            exit: exit_rx,
        })
    }
}

#[async_trait]
impl TerminalProcess for PtyProcess {
    fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        self.input
            .send(data.to_vec())
            .map_err(|_| SandboxError::ExecutionFailed("terminal input closed".to_string()))
    }

    async fn read(&self) -> Option<Vec<u8>> {
        self.output.lock().await.recv().await
    }

    fn resize(&self, size: TerminalSize) -> Result<(), SandboxError> {
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|err| SandboxError::ExecutionFailed(format!("pty resize: {err}")))
    }

    fn kill(&self) -> Result<(), SandboxError> {
        self.killer.lock().kill().map_err(SandboxError::Io)
    }

    async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                // EIO is how Linux reports a hung-up PTY.
                debug!("pty reader stopped: {err}");
                break;
            }
        }
    }
}

fn pump_input(mut writer: Box<dyn Write + Send>, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = input.blocking_recv() {
        if let Err(err) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            debug!("pty writer stopped: {err}");
            break;
        }
    }
}
