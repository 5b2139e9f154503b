//! One accepted connection: telnet bridge, login, then the shell session.

use crate::auth::{Credentials, accept, prompt_credentials};
use crate::telnet::{self, TelnetDecoder};
use crunchy_config::TerminalMode;
use crunchy_sandbox::TerminalSize;
use crunchy_shell::{AuthLog, LineEditor, Newline, SessionContext, SessionEnd, SessionMode};
use crunchy_shell::{serve, shutdown_signal};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const BRIDGE_BUFFER: usize = 64 * 1024;
const RESIZE_QUEUE: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Copy client input into the session, decoding telnet commands if enabled.
async fn pump_inbound<R>(
    mut client: R,
    mut decoder: Option<TelnetDecoder>,
    mut session: WriteHalf<DuplexStream>,
    resizes: mpsc::Sender<TerminalSize>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let read = match client.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!("client read failed (error={})", err);
                break;
            }
        };
        let data = match decoder.as_mut() {
            Some(decoder) => {
                let decoded = decoder.decode(&buf[..read]);
                for size in decoded.resizes {
                    // Line-mode sessions drop the receiver; sizes are then moot.
                    let _ = resizes.try_send(size);
                }
                decoded.data
            }
            None => buf[..read].to_vec(),
        };
        if !data.is_empty() && session.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = session.shutdown().await;
}

/// Copy session output to the client, escaping IAC when telnet is on.
async fn pump_outbound<W>(mut session: ReadHalf<DuplexStream>, mut client: W, telnet: bool)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let read = match session.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        let written = if telnet {
            client.write_all(&telnet::escape_output(&buf[..read])).await
        } else {
            client.write_all(&buf[..read]).await
        };
        if written.is_err() || client.flush().await.is_err() {
            break;
        }
    }
    let _ = client.shutdown().await;
}

/// Shared, read-only state for every connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub session: Arc<SessionContext>,
    pub auth_log: AuthLog,
}

/// Drive one client connection from negotiation to teardown.
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    context: ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = context.session.config.clone();
    let (mut client_read, mut client_write) = tokio::io::split(stream);

    let mut decoder = None;
    let mut initial_size = None;
    let mut pending = Vec::new();
    if config.server.telnet {
        let mut telnet_decoder = TelnetDecoder::new();
        if let Err(err) = client_write.write_all(&telnet::negotiation()).await {
            debug!("telnet negotiation write failed (peer={}, error={})", peer, err);
            return SessionEnd::Disconnected;
        }
        let wait = Duration::from_millis(config.server.negotiation_timeout_ms);
        match telnet::negotiate(&mut client_read, &mut telnet_decoder, wait).await {
            Ok(negotiated) => {
                initial_size = negotiated.size;
                pending = negotiated.pending;
            }
            Err(err) => {
                debug!("telnet negotiation failed (peer={}, error={})", peer, err);
                return SessionEnd::Disconnected;
            }
        }
        decoder = Some(telnet_decoder);
    }

    let (app, bridge) = tokio::io::duplex(BRIDGE_BUFFER);
    let (bridge_read, mut bridge_write) = tokio::io::split(bridge);
    if !pending.is_empty() && bridge_write.write_all(&pending).await.is_err() {
        return SessionEnd::Disconnected;
    }
    let (resize_tx, resize_rx) = mpsc::channel(RESIZE_QUEUE);
    let inbound: JoinHandle<()> = tokio::spawn(pump_inbound(
        client_read,
        decoder,
        bridge_write,
        resize_tx,
    ));
    let outbound = tokio::spawn(pump_outbound(bridge_read, client_write, config.server.telnet));

    let (mut reader, mut writer) = tokio::io::split(app);
    let newline = if config.shell.crlf {
        Newline::CrLf
    } else {
        Newline::Lf
    };
    let mut editor = LineEditor::new(newline);

    let greeted = tokio::select! {
        greeted = greet(&context, &peer, &mut editor, &mut reader, &mut writer) => greeted,
        _ = shutdown_signal(&mut shutdown) => Err(SessionEnd::Shutdown),
    };
    let end = match greeted {
        Ok(()) => {
            let mode = match (config.shell.terminal, initial_size) {
                (TerminalMode::Auto, Some(size)) => SessionMode::Terminal {
                    size,
                    resizes: resize_rx,
                },
                _ => SessionMode::Lines(editor),
            };
            serve(
                context.session.clone(),
                peer.clone(),
                reader,
                writer,
                mode,
                shutdown,
            )
            .await
        }
        Err(end) => {
            let _ = writer.shutdown().await;
            end
        }
    };

    inbound.abort();
    if tokio::time::timeout(DRAIN_TIMEOUT, outbound).await.is_err() {
        warn!("client output did not drain (peer={})", peer);
    }
    info!("connection finished (peer={}, reason={})", peer, end);
    end
}

/// Banner and login. An `Err` carries the reason to stop early.
async fn greet<R, W>(
    context: &ConnectionContext,
    peer: &str,
    editor: &mut LineEditor,
    reader: &mut R,
    writer: &mut W,
) -> Result<(), SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let server = &context.session.config.server;
    if let Some(banner) = &server.banner {
        let text = editor.newline().normalize(&format!("{banner}\n"));
        writer
            .write_all(text.as_bytes())
            .await
            .map_err(|_| SessionEnd::Disconnected)?;
    }
    let credentials = if server.login_prompt {
        match prompt_credentials(editor, reader, writer).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) | Err(_) => return Err(SessionEnd::Disconnected),
        }
    } else {
        Credentials::default()
    };
    accept(&context.auth_log, &credentials, peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ConnectionContext, handle_connection};
    use crate::telnet::{IAC, OPT_NAWS, SB, SE};
    use crunchy_config::{AuditConfig, CrunchyConfig, ServerConfig, ShellConfig, TerminalMode};
    use crunchy_sandbox::{ImageHandle, TerminalSize};
    use crunchy_shell::{AuthLog, SessionContext, SessionEnd};
    use crunchy_test_utils::{FakeRuntime, RuntimeCall};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::watch;

    fn context(dir: &TempDir, runtime: Arc<FakeRuntime>, server: ServerConfig) -> ConnectionContext {
        let audit = AuditConfig {
            dir: dir.path().to_string_lossy().into_owned(),
            ..AuditConfig::default()
        };
        let config = CrunchyConfig::builder()
            .server(server)
            .audit(audit.clone())
            .shell(ShellConfig {
                terminal: TerminalMode::Auto,
                ..ShellConfig::default()
            })
            .build();
        ConnectionContext {
            session: Arc::new(SessionContext {
                runtime,
                image: ImageHandle {
                    reference: "ubuntu".to_string(),
                    id: "sha256:1".to_string(),
                },
                config: Arc::new(config),
                hostname: "srv".to_string(),
            }),
            auth_log: AuthLog::from_config(&audit),
        }
    }

    #[tokio::test]
    async fn plain_client_logs_in_and_runs_commands() {
        let dir = tempdir().expect("tempdir");
        let runtime = Arc::new(FakeRuntime::new());
        let server = ServerConfig {
            telnet: false,
            ..ServerConfig::default()
        };
        let context = context(&dir, runtime.clone(), server);
        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let (_tx, rx) = watch::channel(false);
        client
            .write_all(b"root\nletmein\npwd\nexit\n")
            .await
            .expect("write");
        let end = handle_connection(stream, "198.51.100.1:1000".to_string(), context, rx).await;
        assert_eq!(end, SessionEnd::Exit);

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.expect("read");
        assert_eq!(
            String::from_utf8_lossy(&output),
            "login: root\r\nPassword: \r\n\
             root@srv:/# pwd\r\n/\r\n\
             root@srv:/# exit\r\nGoodbye!\r\n"
        );
        let auth = std::fs::read_to_string(dir.path().join("auth.log")).expect("auth log");
        assert!(auth.ends_with(" - User: root, Pass: letmein, IP: 198.51.100.1:1000\n"));
        assert_eq!(runtime.scripts(), vec!["cd /; pwd".to_string()]);
    }

    #[tokio::test]
    async fn telnet_window_size_selects_terminal_mode() {
        let dir = tempdir().expect("tempdir");
        let runtime = Arc::new(FakeRuntime::new().with_terminal_prompt("# "));
        let server = ServerConfig {
            login_prompt: false,
            negotiation_timeout_ms: 2000,
            ..ServerConfig::default()
        };
        let context = context(&dir, runtime.clone(), server);
        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let (_tx, rx) = watch::channel(false);
        client
            .write_all(&[IAC, SB, OPT_NAWS, 0, 120, 0, 35, IAC, SE])
            .await
            .expect("write naws");
        client.write_all(b"exit\r\n").await.expect("write");
        let end = handle_connection(stream, "198.51.100.2:1000".to_string(), context, rx).await;
        assert_eq!(end, SessionEnd::ShellExited(Some(0)));

        let spawned: Vec<_> = runtime
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::SpawnTerminal { size, .. } => Some(size),
                _ => None,
            })
            .collect();
        assert_eq!(spawned, vec![TerminalSize { cols: 120, rows: 35 }]);
        let auth = std::fs::read_to_string(dir.path().join("auth.log")).expect("auth log");
        assert!(auth.ends_with(" - User: , Pass: , IP: 198.51.100.2:1000\n"));
    }

    #[tokio::test]
    async fn telnet_without_window_size_stays_in_line_mode() {
        let dir = tempdir().expect("tempdir");
        let runtime = Arc::new(FakeRuntime::new());
        let server = ServerConfig {
            login_prompt: false,
            negotiation_timeout_ms: 20,
            ..ServerConfig::default()
        };
        let context = context(&dir, runtime.clone(), server);
        let (mut client, stream) = tokio::io::duplex(64 * 1024);
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(handle_connection(
            stream,
            "198.51.100.3:1000".to_string(),
            context,
            rx,
        ));
        let mut offer = [0u8; 9];
        client.read_exact(&mut offer).await.expect("read offer");
        assert_eq!(offer, crate::telnet::negotiation());
        client.write_all(b"exit\r\0").await.expect("write");
        let end = task.await.expect("join");
        assert_eq!(end, SessionEnd::Exit);
        assert!(runtime.terminals().is_empty());
    }

    #[tokio::test]
    async fn disconnect_before_login_creates_no_sandbox() {
        let dir = tempdir().expect("tempdir");
        let runtime = Arc::new(FakeRuntime::new());
        let server = ServerConfig {
            telnet: false,
            ..ServerConfig::default()
        };
        let context = context(&dir, runtime.clone(), server);
        let (mut client, stream) = tokio::io::duplex(1024);
        let (_tx, rx) = watch::channel(false);
        client.write_all(b"root\n").await.expect("write");
        client.shutdown().await.expect("close");
        let end = handle_connection(stream, "198.51.100.4:1000".to_string(), context, rx).await;
        assert_eq!(end, SessionEnd::Disconnected);
        assert!(runtime.calls().is_empty());
    }
}
