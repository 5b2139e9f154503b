//! Configuration schema for Crunchy.

use serde::{Deserialize, Serialize};

/// Root config for the honeypot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrunchyConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl CrunchyConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> CrunchyConfigBuilder {
        CrunchyConfigBuilder::new()
    }
}

/// Builder for assembling a `CrunchyConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct CrunchyConfigBuilder {
    config: CrunchyConfig,
}

impl CrunchyConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: CrunchyConfig::default(),
        }
    }

    /// Replace the listener configuration.
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.config.server = server;
        self
    }

    /// Replace the sandbox configuration.
    pub fn sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.config.sandbox = sandbox;
        self
    }

    /// Replace the pseudo-shell configuration.
    pub fn shell(mut self, shell: ShellConfig) -> Self {
        self.config.shell = shell;
        self
    }

    /// Replace the audit log configuration.
    pub fn audit(mut self, audit: AuditConfig) -> Self {
        self.config.audit = audit;
        self
    }

    /// Finalize and return the built `CrunchyConfig`.
    pub fn build(self) -> CrunchyConfig {
        self.config
    }
}

/// Listener and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_true")]
    pub telnet: bool,
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub login_prompt: bool,
    #[serde(default)]
    pub banner: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            telnet: true,
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            login_prompt: true,
            banner: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_negotiation_timeout_ms() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

/// Sandbox runtime selection and per-session isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_provider")]
    pub provider: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub snapshot_root: Option<String>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub limits: SandboxLimitsConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            provider: default_sandbox_provider(),
            image: default_image(),
            name_prefix: default_name_prefix(),
            snapshot_root: None,
            network: false,
            limits: SandboxLimitsConfig::default(),
        }
    }
}

/// Providers understood by the server binary.
pub const SANDBOX_PROVIDERS: &[&str] = &["docker", "bubblewrap"];

fn default_sandbox_provider() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "docker.io/library/ubuntu:rolling".to_string()
}

fn default_name_prefix() -> String {
    "crunchy".to_string()
}

/// Static resource limits handed to sandbox creation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SandboxLimitsConfig {
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub nofile: Option<u64>,
    #[serde(default)]
    pub pids: Option<u64>,
    #[serde(default)]
    pub cpus: Option<f64>,
}

/// How the tracked working directory is updated between stateless execs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategyKind {
    /// Predict `cd` locally and prefix every command with the tracked directory.
    #[default]
    ExplicitDirectory,
    /// Let the sandbox report its directory through an output marker.
    MarkerRecovery,
}

/// Whether sessions with a negotiated terminal get a persistent PTY shell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminalMode {
    /// Use the PTY passthrough whenever the peer reports a window size.
    #[default]
    Auto,
    /// Always use the line-mode dispatcher.
    Never,
}

/// Pseudo-shell presentation and execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub strategy: ExecutionStrategyKind,
    #[serde(default)]
    pub terminal: TerminalMode,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default = "default_start_dir")]
    pub start_dir: String,
    #[serde(default = "default_shell_path")]
    pub shell_path: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default = "default_exit_commands")]
    pub exit_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub crlf: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategyKind::default(),
            terminal: TerminalMode::default(),
            user: default_user(),
            hostname: None,
            home: default_home(),
            start_dir: default_start_dir(),
            shell_path: default_shell_path(),
            path: default_path(),
            term: default_term(),
            command_timeout_secs: default_command_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            kill_timeout_ms: default_kill_timeout_ms(),
            exit_commands: default_exit_commands(),
            crlf: true,
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_home() -> String {
    "/root".to_string()
}

fn default_start_dir() -> String {
    "/".to_string()
}

fn default_shell_path() -> String {
    "/bin/bash".to_string()
}

/// Minimal PATH handed to every sandboxed process.
fn default_path() -> String {
    "/bin:/usr/bin:/sbin:/usr/sbin".to_string()
}

fn default_term() -> String {
    "xterm".to_string()
}

fn default_command_timeout_secs() -> u64 {
    60
}

/// Default cap on captured bytes per stream.
fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_kill_timeout_ms() -> u64 {
    2000
}

fn default_exit_commands() -> Vec<String> {
    vec!["exit".to_string(), "logout".to_string()]
}

/// Per-session and authentication log locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub dir: String,
    #[serde(default = "default_true")]
    pub include_peer_in_filename: bool,
    #[serde(default = "default_auth_log")]
    pub auth_log: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            include_peer_in_filename: true,
            auth_log: default_auth_log(),
        }
    }
}

fn default_audit_dir() -> String {
    "./logs".to_string()
}

fn default_auth_log() -> String {
    "auth.log".to_string()
}
