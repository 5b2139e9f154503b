//! Append-only audit logs for operators.
//!
//! Each session gets its own log file holding the connection header, every
//! command line and its output block, any raw terminal transcript, and a
//! closing line. Authentication attempts go to one shared file. Write
//! failures are reported through `log` and otherwise ignored; only failing
//! to open a session log is an error.

use crate::error::ShellError;
use crate::types::SessionEnd;
use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use crunchy_config::AuditConfig;
use log::{debug, warn};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Separator written after every output block.
pub const BLOCK_DELIMITER: &str = "--------";

fn open_append(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Per-session log file.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl SessionLog {
    /// Log path for a session, optionally tagged with the peer address.
    pub fn path_for(config: &AuditConfig, session_id: Uuid, peer: &str) -> PathBuf {
        let name = if config.include_peer_in_filename {
            format!("{session_id}-{peer}.log")
        } else {
            format!("{session_id}.log")
        };
        Path::new(&config.dir).join(name)
    }

    /// Open (or create) the log at `path` for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ShellError> {
        let path = path.into();
        let file = open_append(&path).map_err(|source| ShellError::Audit {
            path: path.clone(),
            source,
        })?;
        debug!("session log opened (path={})", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, bytes: &[u8]) {
        let mut file = self.file.lock();
        if let Err(err) = file.write_all(bytes) {
            warn!(
                "session log write failed (path={}, error={})",
                self.path.display(),
                err
            );
        }
    }

    /// Connection header.
    pub fn header(&self, peer: &str) {
        self.append(format!("Connection from: {peer}\n{BLOCK_DELIMITER}\n").as_bytes());
    }

    /// Raw command line as typed.
    pub fn command(&self, line: &str) {
        self.append(format!("{line}\n").as_bytes());
    }

    /// Output block for one command. Both streams empty still closes a block.
    pub fn output(&self, stdout: &str, stderr: &str) {
        let mut record = String::new();
        if !stdout.is_empty() {
            record.push_str(&format!("\n{stdout}\n{BLOCK_DELIMITER}\n"));
        }
        if !stderr.is_empty() {
            record.push_str(&format!("\n{stderr}\n{BLOCK_DELIMITER}\n"));
        }
        if record.is_empty() {
            record = format!("\n\n{BLOCK_DELIMITER}\n");
        }
        self.append(record.as_bytes());
    }

    /// A command that failed to run, recorded as its output block.
    pub fn error(&self, message: &str) {
        self.output("", message);
    }

    /// Raw terminal bytes from an interactive session.
    pub fn transcript(&self, bytes: &[u8]) {
        self.append(bytes);
    }

    /// Closing line with the reason the session ended.
    pub fn end(&self, reason: &SessionEnd) {
        self.append(format!("Session closed: {reason}\n").as_bytes());
        let mut file = self.file.lock();
        if let Err(err) = file.flush() {
            warn!(
                "session log flush failed (path={}, error={})",
                self.path.display(),
                err
            );
        }
    }
}

/// Format one authentication record.
pub fn auth_line<Tz>(at: DateTime<Tz>, user: &str, password: &str, peer: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{} - User: {user}, Pass: {password}, IP: {peer}\n",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Shared log of every authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthLog {
    path: PathBuf,
}

impl AuthLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(Path::new(&config.dir).join(&config.auth_log))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one attempt. Failures are logged and dropped.
    pub fn record(&self, user: &str, password: &str, peer: &str) {
        let line = auth_line(Local::now(), user, password, peer);
        let written = open_append(&self.path).and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = written {
            warn!(
                "auth log write failed (path={}, error={})",
                self.path.display(),
                err
            );
        }
    }
}
