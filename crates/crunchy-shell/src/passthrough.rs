//! Interactive passthrough between the peer and one long-lived sandbox shell.

use crate::audit::SessionLog;
use crate::error::ShellError;
use crate::types::{SessionEnd, shutdown_signal};
use crunchy_sandbox::{TerminalProcess, TerminalSize};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 4096;

/// Forward window-size changes to the terminal until the stream closes.
pub fn spawn_resize_forwarder(
    terminal: Arc<dyn TerminalProcess>,
    mut resizes: mpsc::Receiver<TerminalSize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(size) = resizes.recv().await {
            debug!("forwarding resize (cols={}, rows={})", size.cols, size.rows);
            if let Err(err) = terminal.resize(size) {
                warn!("terminal resize failed (error={})", err);
            }
        }
    })
}

/// Kill the shell and wait for it, giving up after `limit`.
pub async fn stop_terminal(terminal: &dyn TerminalProcess, limit: Duration) -> Option<i32> {
    if let Err(err) = terminal.kill() {
        warn!("terminal kill failed (error={})", err);
    }
    match tokio::time::timeout(limit, terminal.wait()).await {
        Ok(code) => code,
        Err(_) => {
            warn!(
                "terminal did not exit after kill (timeout_ms={})",
                limit.as_millis()
            );
            None
        }
    }
}

/// Pump bytes both ways until the shell exits, the peer leaves, or the
/// server shuts down. Output is mirrored into the session transcript.
pub async fn run_passthrough<R, W>(
    terminal: Arc<dyn TerminalProcess>,
    reader: &mut R,
    writer: &mut W,
    resizes: mpsc::Receiver<TerminalSize>,
    log: &SessionLog,
    kill_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionEnd, ShellError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let forwarder = spawn_resize_forwarder(terminal.clone(), resizes);
    let pumped = pump(terminal.as_ref(), reader, writer, log, &mut shutdown).await;
    forwarder.abort();
    match pumped {
        Ok(SessionEnd::ShellExited(code)) => {
            info!("interactive shell exited (code={:?})", code);
            Ok(SessionEnd::ShellExited(code))
        }
        other => {
            let code = stop_terminal(terminal.as_ref(), kill_timeout).await;
            debug!("interactive shell stopped (code={:?})", code);
            other
        }
    }
}

async fn pump<R, W>(
    terminal: &dyn TerminalProcess,
    reader: &mut R,
    writer: &mut W,
    log: &SessionLog,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, ShellError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let read = read?;
                if read == 0 {
                    return Ok(SessionEnd::Disconnected);
                }
                if let Err(err) = terminal.write(&buf[..read]) {
                    debug!("terminal input dropped (error={})", err);
                }
            }
            output = terminal.read() => match output {
                Some(bytes) => {
                    writer.write_all(&bytes).await?;
                    writer.flush().await?;
                    log.transcript(&bytes);
                }
                None => return Ok(SessionEnd::ShellExited(terminal.wait().await)),
            },
            _ = shutdown_signal(shutdown) => return Ok(SessionEnd::Shutdown),
        }
    }
}
