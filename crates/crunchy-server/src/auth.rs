//! Credential capture. Every attempt is recorded and accepted.

use crunchy_shell::{AuthLog, LineEditor};
use log::info;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Username and password exactly as the peer typed them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Ask for a username (echoed) and a password (not echoed).
///
/// Returns `Ok(None)` if the peer disconnects before answering both.
pub async fn prompt_credentials<R, W>(
    editor: &mut LineEditor,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<Option<Credentials>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    editor.set_echo(true);
    writer.write_all(b"login: ").await?;
    writer.flush().await?;
    let Some(user) = editor.read_line(reader, writer).await? else {
        return Ok(None);
    };

    editor.set_echo(false);
    writer.write_all(b"Password: ").await?;
    writer.flush().await?;
    let password = editor.read_line(reader, writer).await;
    editor.set_echo(true);
    let Some(password) = password? else {
        return Ok(None);
    };
    Ok(Some(Credentials {
        user: user.trim().to_string(),
        password,
    }))
}

/// Record an attempt and accept it.
pub fn accept(log: &AuthLog, credentials: &Credentials, peer: &str) -> bool {
    log.record(&credentials.user, &credentials.password, peer);
    info!(
        "login accepted (peer={}, user={})",
        peer, credentials.user
    );
    true
}

#[cfg(test)]
mod tests {
    use super::{Credentials, accept, prompt_credentials};
    use crunchy_shell::{AuthLog, LineEditor, Newline};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn password_is_not_echoed() {
        let mut editor = LineEditor::new(Newline::CrLf);
        let mut input: &[u8] = b" admin \rs3cr\x7fet\rpwd\r";
        let mut output = Vec::new();
        let credentials = prompt_credentials(&mut editor, &mut input, &mut output)
            .await
            .expect("prompt")
            .expect("credentials");
        assert_eq!(
            credentials,
            Credentials {
                user: "admin".to_string(),
                password: "s3cet".to_string(),
            }
        );
        assert_eq!(
            String::from_utf8_lossy(&output),
            "login:  admin \r\nPassword: \r\n"
        );
        let next = editor
            .read_line(&mut input, &mut output)
            .await
            .expect("read");
        assert_eq!(next.as_deref(), Some("pwd"));
    }

    #[tokio::test]
    async fn disconnect_during_login_yields_nothing() {
        let mut editor = LineEditor::new(Newline::CrLf);
        let mut input: &[u8] = b"root\r";
        let mut output = Vec::new();
        let credentials = prompt_credentials(&mut editor, &mut input, &mut output)
            .await
            .expect("prompt");
        assert_eq!(credentials, None);
    }

    #[test]
    fn every_attempt_is_logged_and_accepted() {
        let dir = tempdir().expect("tempdir");
        let log = AuthLog::new(dir.path().join("auth.log"));
        let credentials = Credentials {
            user: "root".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(accept(&log, &credentials, "203.0.113.9:2200"));
        let contents = std::fs::read_to_string(log.path()).expect("read");
        assert!(contents.ends_with(" - User: root, Pass: hunter2, IP: 203.0.113.9:2200\n"));
    }
}
