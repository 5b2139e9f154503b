//! Session lifecycle: one sandbox, one log, one peer.

use crate::audit::SessionLog;
use crate::cwd::DirectoryTracker;
use crate::dispatcher::Dispatcher;
use crate::error::ShellError;
use crate::line_editor::{LineEditor, Newline};
use crate::passthrough::run_passthrough;
use crate::strategy::strategy_for;
use crate::types::{CommandOutcome, SessionEnd, Step, shutdown_signal};
use crunchy_config::CrunchyConfig;
use crunchy_sandbox::{
    ImageHandle, ProcessSpec, SandboxHandle, SandboxRuntime, TerminalSize, policy_from_config,
};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// State shared read-only by every session.
pub struct SessionContext {
    pub runtime: Arc<dyn SandboxRuntime>,
    /// Image pulled once at startup.
    pub image: ImageHandle,
    pub config: Arc<CrunchyConfig>,
    /// Hostname shown in the prompt and set inside the sandbox.
    pub hostname: String,
}

impl SessionContext {
    fn newline(&self) -> Newline {
        if self.config.shell.crlf {
            Newline::CrLf
        } else {
            Newline::Lf
        }
    }
}

/// How the peer's terminal is driven.
pub enum SessionMode {
    /// Line-at-a-time commands through the dispatcher. The editor may already
    /// hold bytes typed during login.
    Lines(LineEditor),
    /// Raw passthrough to one long-lived shell.
    Terminal {
        size: TerminalSize,
        resizes: mpsc::Receiver<TerminalSize>,
    },
}

/// A connected peer with its own sandbox and session log.
pub struct Session {
    id: Uuid,
    peer: String,
    context: Arc<SessionContext>,
    log: SessionLog,
    handle: Option<SandboxHandle>,
    tracker: DirectoryTracker,
}

impl Session {
    /// Open the session log and create the sandbox. Either failing is fatal.
    pub async fn open(
        context: Arc<SessionContext>,
        peer: impl Into<String>,
    ) -> Result<Self, ShellError> {
        let id = Uuid::new_v4();
        let peer = peer.into();
        let config = &context.config;
        let log = SessionLog::open(SessionLog::path_for(&config.audit, id, &peer))?;
        log.header(&peer);

        let policy = policy_from_config(&config.sandbox, Some(context.hostname.clone()));
        let handle = match context.runtime.create(id, &context.image, &policy).await {
            Ok(handle) => handle,
            Err(err) => {
                let err = ShellError::SandboxCreation(err);
                log.end(&SessionEnd::Failed(err.to_string()));
                return Err(err);
            }
        };
        info!(
            "session opened (session_id={}, peer={}, sandbox={}, runtime={})",
            id,
            peer,
            handle.name,
            context.runtime.name()
        );
        let tracker = DirectoryTracker::new(&config.shell.start_dir, &config.shell.home);
        Ok(Self {
            id,
            peer,
            context,
            log,
            handle: Some(handle),
            tracker,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn directory(&self) -> &str {
        self.tracker.current()
    }

    fn live_handle(&self) -> Result<SandboxHandle, ShellError> {
        self.handle.clone().ok_or_else(|| {
            ShellError::SandboxCreation(crunchy_sandbox::SandboxError::UnknownSandbox(self.id))
        })
    }

    /// Shell prompt for the current directory.
    pub fn prompt(&self) -> String {
        let shell = &self.context.config.shell;
        let sigil = if shell.user == "root" { '#' } else { '$' };
        format!(
            "{}@{}:{}{sigil} ",
            shell.user,
            self.context.hostname,
            self.tracker.current()
        )
    }

    /// Read, dispatch and answer command lines until the session ends.
    pub async fn run_lines<R, W>(
        &mut self,
        editor: &mut LineEditor,
        reader: &mut R,
        writer: &mut W,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd, ShellError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let dispatcher = Dispatcher::new(
            self.context.runtime.clone(),
            self.live_handle()?,
            strategy_for(self.context.config.shell.strategy),
            &self.context.config.shell,
        );
        debug!(
            "line mode started (session_id={}, strategy={})",
            self.id,
            dispatcher.strategy_name()
        );
        editor.set_echo(true);
        loop {
            writer.write_all(self.prompt().as_bytes()).await?;
            writer.flush().await?;
            let line = tokio::select! {
                line = editor.read_line(reader, writer) => line?,
                _ = shutdown_signal(&mut shutdown) => return Ok(SessionEnd::Shutdown),
            };
            let Some(line) = line else {
                return Ok(SessionEnd::Disconnected);
            };
            let step = tokio::select! {
                step = self.handle_line(&dispatcher, &line, writer) => step?,
                _ = shutdown_signal(&mut shutdown) => return Ok(SessionEnd::Shutdown),
            };
            if step == Step::Exit {
                return Ok(SessionEnd::Exit);
            }
        }
    }

    /// Handle one raw line from the editor.
    pub async fn handle_line<W>(
        &mut self,
        dispatcher: &Dispatcher,
        line: &str,
        writer: &mut W,
    ) -> Result<Step, ShellError>
    where
        W: AsyncWrite + Unpin,
    {
        let command = line.trim();
        if command.is_empty() {
            return Ok(Step::Continue);
        }
        self.log.command(command);
        let newline = self.context.newline();
        let shell = &self.context.config.shell;
        if shell.exit_commands.iter().any(|exit| exit == command) {
            writer
                .write_all(newline.normalize("Goodbye!\n").as_bytes())
                .await?;
            writer.flush().await?;
            return Ok(Step::Exit);
        }

        match dispatcher.dispatch(command, &mut self.tracker).await {
            Ok(outcome) => {
                let (stdout, stderr) = visible_output(&outcome);
                self.log.output(stdout, stderr);
                let mut reply = String::new();
                for stream in [stdout, stderr] {
                    if !stream.is_empty() {
                        reply.push_str(stream);
                        reply.push('\n');
                    }
                }
                if !reply.is_empty() {
                    writer
                        .write_all(newline.normalize(&reply).as_bytes())
                        .await?;
                }
            }
            Err(err) if !err.is_fatal() => {
                let message = err.to_string();
                warn!(
                    "command failed (session_id={}, error={})",
                    self.id, message
                );
                self.log.error(&message);
                writer
                    .write_all(newline.normalize(&format!("{message}\n")).as_bytes())
                    .await?;
            }
            Err(err) => return Err(err),
        }
        writer.flush().await?;
        Ok(Step::Continue)
    }

    /// Attach the peer to one interactive shell in the sandbox.
    pub async fn run_terminal<R, W>(
        &mut self,
        size: TerminalSize,
        resizes: mpsc::Receiver<TerminalSize>,
        reader: &mut R,
        writer: &mut W,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd, ShellError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let shell = &self.context.config.shell;
        let mut spec = ProcessSpec::new(vec![shell.shell_path.clone(), "-l".to_string()]);
        spec.env = BTreeMap::from([
            ("PATH".to_string(), shell.path.clone()),
            ("TERM".to_string(), shell.term.clone()),
            ("HOME".to_string(), shell.home.clone()),
        ]);
        spec.cwd = Some(self.tracker.current().to_string());
        let handle = self.live_handle()?;
        debug!(
            "terminal mode started (session_id={}, exec_id={}, cols={}, rows={})",
            self.id, spec.exec_id, size.cols, size.rows
        );
        let terminal = self
            .context
            .runtime
            .spawn_terminal(&handle, spec, size)
            .await
            .map_err(ShellError::Execution)?;
        run_passthrough(
            terminal,
            reader,
            writer,
            resizes,
            &self.log,
            Duration::from_millis(shell.kill_timeout_ms),
            shutdown,
        )
        .await
    }

    /// Tear down the sandbox and close the log.
    pub async fn close(mut self, end: &SessionEnd) {
        if let Some(handle) = self.handle.take() {
            self.context.runtime.destroy(handle).await;
        }
        self.log.end(end);
        info!(
            "session closed (session_id={}, peer={}, reason={})",
            self.id, self.peer, end
        );
    }
}

/// Stdout minus one trailing newline, stderr trimmed.
fn visible_output(outcome: &CommandOutcome) -> (&str, &str) {
    let stdout = outcome
        .stdout
        .strip_suffix('\n')
        .unwrap_or(&outcome.stdout);
    (stdout, outcome.stderr.trim())
}

/// Run a whole session for one peer. The sandbox is always released.
pub async fn serve<R, W>(
    context: Arc<SessionContext>,
    peer: String,
    mut reader: R,
    mut writer: W,
    mode: SessionMode,
    shutdown: watch::Receiver<bool>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = match Session::open(context, peer.clone()).await {
        Ok(session) => session,
        Err(err) => {
            error!("session setup failed (peer={}, error={})", peer, err);
            return SessionEnd::Failed(err.to_string());
        }
    };
    let result = match mode {
        SessionMode::Lines(mut editor) => {
            session
                .run_lines(&mut editor, &mut reader, &mut writer, shutdown)
                .await
        }
        SessionMode::Terminal { size, resizes } => {
            session
                .run_terminal(size, resizes, &mut reader, &mut writer, shutdown)
                .await
        }
    };
    let end = match result {
        Ok(end) => end,
        Err(err) => {
            warn!(
                "session ended with error (session_id={}, error={})",
                session.id(),
                err
            );
            SessionEnd::Failed(err.to_string())
        }
    };
    let _ = writer.shutdown().await;
    session.close(&end).await;
    end
}
