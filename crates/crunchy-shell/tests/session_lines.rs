//! Line-mode sessions driven end to end against the fake runtime.

use crunchy_config::{AuditConfig, CrunchyConfig, ExecutionStrategyKind, ShellConfig};
use crunchy_sandbox::ImageHandle;
use crunchy_shell::{LineEditor, Newline, SessionContext, SessionEnd, SessionMode, serve};
use crunchy_test_utils::{FakeRuntime, RuntimeCall};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

const PEER: &str = "10.1.1.1:4000";

fn config(dir: &TempDir, strategy: ExecutionStrategyKind) -> CrunchyConfig {
    CrunchyConfig::builder()
        .shell(ShellConfig {
            strategy,
            ..ShellConfig::default()
        })
        .audit(AuditConfig {
            dir: dir.path().to_string_lossy().into_owned(),
            ..AuditConfig::default()
        })
        .build()
}

fn context(runtime: Arc<FakeRuntime>, config: CrunchyConfig) -> Arc<SessionContext> {
    Arc::new(SessionContext {
        runtime,
        image: ImageHandle {
            reference: "ubuntu".to_string(),
            id: "sha256:abc".to_string(),
        },
        config: Arc::new(config),
        hostname: "box".to_string(),
    })
}

/// Feed `input` to a fresh session, optionally closing the client side
/// afterwards, and collect everything sent back.
async fn run_session(
    context: Arc<SessionContext>,
    input: &[u8],
    close_input: bool,
) -> (SessionEnd, String) {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(server);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    client.write_all(input).await.expect("write input");
    if close_input {
        client.shutdown().await.expect("close input");
    }
    let end = serve(
        context,
        PEER.to_string(),
        reader,
        writer,
        SessionMode::Lines(LineEditor::new(Newline::CrLf)),
        shutdown_rx,
    )
    .await;
    let mut output = Vec::new();
    client.read_to_end(&mut output).await.expect("read output");
    (end, String::from_utf8_lossy(&output).into_owned())
}

fn session_log(dir: &Path) -> String {
    let entries: Vec<_> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(entries.len(), 1, "expected one session log: {entries:?}");
    let name = entries[0]
        .file_name()
        .expect("file name")
        .to_string_lossy()
        .into_owned();
    assert!(name.ends_with(&format!("-{PEER}.log")), "log name {name}");
    std::fs::read_to_string(&entries[0]).expect("read log")
}

#[tokio::test]
async fn cd_then_pwd_under_explicit_directory() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (end, output) = run_session(context, b"cd /var/log\rpwd\rexit\r", false).await;

    assert_eq!(end, SessionEnd::Exit);
    assert_eq!(
        output,
        "root@box:/# cd /var/log\r\n\
         root@box:/var/log# pwd\r\n/var/log\r\n\
         root@box:/var/log# exit\r\nGoodbye!\r\n"
    );
    assert_eq!(
        runtime.scripts(),
        vec!["cd /; cd /var/log".to_string(), "cd /var/log; pwd".to_string()]
    );
    assert_eq!(
        session_log(dir.path()),
        format!(
            "Connection from: {PEER}\n--------\n\
             cd /var/log\n\n\n--------\n\
             pwd\n\n/var/log\n--------\n\
             exit\n\
             Session closed: exit\n"
        )
    );
    assert_eq!(runtime.live_sandboxes(), 0);
}

#[tokio::test]
async fn relative_cd_under_explicit_directory_prints_nothing() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (_, output) = run_session(context, b"cd /var\rcd log\rpwd\rexit\r", false).await;

    assert_eq!(
        output,
        "root@box:/# cd /var\r\n\
         root@box:/var# cd log\r\n\
         root@box:/var/log# pwd\r\n/var/log\r\n\
         root@box:/var/log# exit\r\nGoodbye!\r\n"
    );
    assert_eq!(
        runtime.scripts(),
        vec![
            "cd /; cd /var".to_string(),
            "cd /var; cd log".to_string(),
            "cd /var/log; pwd".to_string(),
        ]
    );
    assert!(!session_log(dir.path()).contains("No such file"));
}

#[tokio::test]
async fn cd_then_pwd_under_marker_recovery() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::MarkerRecovery),
    );
    let (end, output) = run_session(context, b"cd /var/log\r\npwd\r\nexit\r\n", false).await;

    assert_eq!(end, SessionEnd::Exit);
    assert_eq!(
        output,
        "root@box:/# cd /var/log\r\n\
         root@box:/var/log# pwd\r\n/var/log\r\n\
         root@box:/var/log# exit\r\nGoodbye!\r\n"
    );
    let log = session_log(dir.path());
    assert!(!log.contains("__CWD__"), "marker leaked into log: {log}");
    assert!(log.contains("pwd\n\n/var/log\n--------\n"));
}

#[tokio::test]
async fn failed_cd_keeps_directory_under_marker_recovery() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(runtime, config(&dir, ExecutionStrategyKind::MarkerRecovery));
    let (_, output) = run_session(context, b"cd /tmp\rcd nowhere\rexit\r", false).await;
    assert_eq!(
        output,
        "root@box:/# cd /tmp\r\n\
         root@box:/tmp# cd nowhere\r\n\
         bash: cd: nowhere: No such file or directory\r\n\
         root@box:/tmp# exit\r\nGoodbye!\r\n"
    );
}

#[tokio::test]
async fn exit_never_reaches_the_sandbox() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (end, _) = run_session(context, b"  exit  \r", false).await;
    assert_eq!(end, SessionEnd::Exit);
    let calls = runtime.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], RuntimeCall::Create(_)));
    assert!(matches!(calls[1], RuntimeCall::Destroy(_)));
}

#[tokio::test]
async fn blank_lines_reprompt_without_logging() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (_, output) = run_session(context, b"   \rlogout\r", false).await;
    assert_eq!(
        output,
        "root@box:/#    \r\nroot@box:/# logout\r\nGoodbye!\r\n"
    );
    assert!(runtime.scripts().is_empty());
    assert_eq!(
        session_log(dir.path()),
        format!("Connection from: {PEER}\n--------\nlogout\nSession closed: exit\n")
    );
}

#[tokio::test]
async fn backspace_edits_before_dispatch() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (_, output) = run_session(context, b"pwdd\x7f\rexit\r", false).await;
    assert_eq!(
        output,
        "root@box:/# pwdd\x08 \x08\r\n/\r\nroot@box:/# exit\r\nGoodbye!\r\n"
    );
    assert_eq!(runtime.scripts(), vec!["cd /; pwd".to_string()]);
}

#[tokio::test]
async fn execution_failures_are_reported_and_the_session_continues() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new().with_exec_failure("container is gone"));
    let context = context(
        runtime,
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (end, output) = run_session(context, b"id\rexit\r", false).await;
    assert_eq!(end, SessionEnd::Exit);
    assert_eq!(
        output,
        "root@box:/# id\r\nexecution failed: container is gone\r\n\
         root@box:/# exit\r\nGoodbye!\r\n"
    );
    assert!(session_log(dir.path()).contains(
        "id\n\nexecution failed: container is gone\n--------\n"
    ));
}

#[tokio::test]
async fn stdout_and_stderr_are_shown_and_logged_separately() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new().with_response(
        "cat /etc/shadow",
        "root:*:19000:0:99999:7:::\n",
        "cat: warning\n\n",
        0,
    ));
    let context = context(
        runtime,
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (_, output) = run_session(context, b"cat /etc/shadow\rexit\r", false).await;
    assert_eq!(
        output,
        "root@box:/# cat /etc/shadow\r\n\
         root:*:19000:0:99999:7:::\r\ncat: warning\r\n\
         root@box:/# exit\r\nGoodbye!\r\n"
    );
    assert!(session_log(dir.path()).contains(
        "cat /etc/shadow\n\nroot:*:19000:0:99999:7:::\n--------\n\ncat: warning\n--------\n"
    ));
}

#[tokio::test]
async fn disconnect_tears_down_the_sandbox() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (end, _) = run_session(context, b"pwd\r", true).await;
    assert_eq!(end, SessionEnd::Disconnected);
    assert_eq!(runtime.live_sandboxes(), 0);
    assert!(session_log(dir.path()).ends_with("Session closed: peer disconnected\n"));
}

#[tokio::test]
async fn sandbox_creation_failure_ends_before_prompt() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new().with_create_failure("no space left"));
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (end, output) = run_session(context, b"pwd\r", false).await;
    assert!(matches!(end, SessionEnd::Failed(ref reason) if reason.contains("no space left")));
    assert_eq!(output, "");
    assert!(runtime.scripts().is_empty());
}

#[tokio::test]
async fn missing_log_directory_is_fatal() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(&dir, ExecutionStrategyKind::ExplicitDirectory);
    config.audit.dir = dir.path().join("absent").to_string_lossy().into_owned();
    let runtime = Arc::new(FakeRuntime::new());
    let (end, output) = run_session(context(runtime.clone(), config), b"pwd\r", false).await;
    assert!(matches!(end, SessionEnd::Failed(_)));
    assert_eq!(output, "");
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn shutdown_ends_an_idle_session() {
    let dir = tempdir().expect("tempdir");
    let runtime = Arc::new(FakeRuntime::new());
    let context = context(
        runtime.clone(),
        config(&dir, ExecutionStrategyKind::ExplicitDirectory),
    );
    let (_client, server) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(server);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(serve(
        context,
        PEER.to_string(),
        reader,
        writer,
        SessionMode::Lines(LineEditor::new(Newline::CrLf)),
        shutdown_rx,
    ));
    shutdown_tx.send(true).expect("send shutdown");
    let end = task.await.expect("join");
    assert_eq!(end, SessionEnd::Shutdown);
    assert_eq!(runtime.live_sandboxes(), 0);
}
