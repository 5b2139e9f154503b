//! Pseudo-shell session engine.
//!
//! Turns a raw byte stream from a remote terminal into command lines, runs
//! each one in the session's sandbox, keeps a logical working directory
//! across those stateless runs, and writes the audit trail. An interactive
//! passthrough mode attaches the peer to one long-lived shell instead.

pub mod audit;
pub mod cwd;
pub mod dispatcher;
pub mod error;
pub mod line_editor;
pub mod marker;
pub mod passthrough;
pub mod session;
pub mod strategy;
pub mod types;

pub use audit::{AuthLog, SessionLog};
pub use cwd::{DirectoryTracker, clean_path, resolve_cd};
pub use dispatcher::Dispatcher;
pub use error::ShellError;
pub use line_editor::{Feed, LineEditor, Newline};
pub use marker::{DirectoryMarker, MarkerScan};
pub use passthrough::run_passthrough;
pub use session::{Session, SessionContext, SessionMode, serve};
pub use strategy::{
    ExecutionStrategy, ExplicitDirectoryStrategy, MarkerRecoveryStrategy, PreparedCommand,
    strategy_for,
};
pub use types::{CommandOutcome, SessionEnd, Step, shutdown_signal};
