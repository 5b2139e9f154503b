//! Tests for layered configuration loading.

use super::*;
use crate::{ExecutionStrategyKind, TerminalMode};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write JSON5 contents to a path, creating parent directories if needed.
fn write_json5(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("dir");
    }
    fs::write(path, contents).expect("write");
}

fn isolated_options(cwd: &Path) -> LayeredConfigOptions {
    let mut options = LayeredConfigOptions::new(cwd);
    options.system_config_path = None;
    options.user_config_path = None;
    options.requirements_path = None;
    options
}

#[test]
fn parse_minimal_config() {
    let config = CrunchyConfig::load_from_str("{}").expect("config");
    assert_eq!(config.server.listen, "0.0.0.0:2222");
    assert_eq!(config.sandbox.provider, "docker");
    assert_eq!(config.shell.strategy, ExecutionStrategyKind::ExplicitDirectory);
    assert_eq!(config.shell.terminal, TerminalMode::Auto);
    assert_eq!(config.shell.home, "/root");
    assert_eq!(config.shell.path, "/bin:/usr/bin:/sbin:/usr/sbin");
    assert_eq!(config.audit.auth_log, "auth.log");
}

#[test]
fn parses_strategy_and_terminal_modes() {
    let json5 = r#"{
        shell: { strategy: "marker_recovery", terminal: "never", home: "/home/admin" },
    }"#;
    let config = CrunchyConfig::load_from_str(json5).expect("config");
    assert_eq!(config.shell.strategy, ExecutionStrategyKind::MarkerRecovery);
    assert_eq!(config.shell.terminal, TerminalMode::Never);
    assert_eq!(config.shell.home, "/home/admin");
}

#[test]
fn rejects_unknown_top_level_key() {
    let err = CrunchyConfig::load_from_str("{ unexpected: true }").unwrap_err();
    assert!(format!("{err}").contains("unknown key"));
}

#[test]
fn rejects_invalid_strategy() {
    let err = CrunchyConfig::load_from_str(r#"{ shell: { strategy: "telepathy" } }"#)
        .unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("shell.strategy"));
    assert!(msg.contains("invalid execution strategy"));
}

#[test]
fn rejects_unknown_provider() {
    let err = CrunchyConfig::load_from_str(r#"{ sandbox: { provider: "vmware" } }"#)
        .unwrap_err();
    assert!(format!("{err}").contains("sandbox.provider"));
}

#[test]
fn rejects_negative_limits() {
    let err = CrunchyConfig::load_from_str(r#"{ sandbox: { limits: { pids: -1 } } }"#)
        .unwrap_err();
    assert!(format!("{err}").contains("sandbox.limits.pids"));
}

#[test]
fn rejects_relative_home() {
    let err = CrunchyConfig::load_from_str(r#"{ shell: { home: "root" } }"#).unwrap_err();
    assert!(format!("{err}").contains("shell.home must be an absolute path"));
}

#[test]
fn layered_config_prefers_cwd_over_user_and_system() {
    let temp = TempDir::new().expect("tmp");
    let root = temp.path();
    let cwd = root.join("deploy");
    fs::create_dir_all(&cwd).expect("cwd");

    let system_config = root.join("system.json5");
    write_json5(&system_config, r#"{ shell: { user: "system" } }"#);
    let user_config = root.join("user.json5");
    write_json5(
        &user_config,
        r#"{ shell: { user: "user" }, audit: { dir: "/var/log/crunchy" } }"#,
    );
    write_json5(&cwd.join(DEFAULT_CONFIG_FILE), r#"{ shell: { user: "admin" } }"#);

    let mut options = isolated_options(&cwd);
    options.system_config_path = Some(system_config);
    options.user_config_path = Some(user_config);

    let layered = CrunchyConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.shell.user, "admin");
    assert_eq!(layered.config.audit.dir, "/var/log/crunchy");
    assert_eq!(layered.layers.len(), 3);
}

#[test]
fn runtime_layer_overrides_everything_else() {
    let temp = TempDir::new().expect("tmp");
    let root = temp.path();
    write_json5(
        &root.join(DEFAULT_CONFIG_FILE),
        r#"{ server: { listen: "127.0.0.1:2323" } }"#,
    );
    let runtime = root.join("runtime.json5");
    write_json5(&runtime, r#"{ server: { listen: "127.0.0.1:4444" } }"#);

    let options = isolated_options(root).with_runtime_path(&runtime);
    let layered = CrunchyConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.server.listen, "127.0.0.1:4444");
    assert_eq!(
        layered.layers.last().map(|layer| layer.source),
        Some(ConfigLayerSource::Runtime)
    );
}

#[test]
fn requirements_lock_overrides() {
    let temp = TempDir::new().expect("tmp");
    let root = temp.path();

    let requirements = root.join("requirements.json5");
    write_json5(&requirements, r#"{ sandbox: { network: false } }"#);
    let runtime = root.join("runtime.json5");
    write_json5(
        &runtime,
        r#"{ sandbox: { network: true, image: "docker.io/library/debian:stable" } }"#,
    );

    let mut options = isolated_options(root).with_runtime_path(&runtime);
    options.requirements_path = Some(requirements);

    let layered = CrunchyConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.sandbox.network, false);
    assert_eq!(layered.config.sandbox.image, "docker.io/library/debian:stable");
}

#[test]
fn missing_runtime_layer_is_an_error() {
    let temp = TempDir::new().expect("tmp");
    let options = isolated_options(temp.path()).with_runtime_path(temp.path().join("nope.json5"));
    let err = CrunchyConfig::load_layered_with_options(options).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFailed(_)));
}

#[test]
fn blank_layer_files_are_empty_layers() {
    let temp = TempDir::new().expect("tmp");
    write_json5(&temp.path().join(DEFAULT_CONFIG_FILE), "  \n");
    let layered =
        CrunchyConfig::load_layered_with_options(isolated_options(temp.path())).expect("load");
    assert_eq!(layered.layers.len(), 1);
    assert_eq!(layered.layers[0].source, ConfigLayerSource::Cwd);
    assert_eq!(layered.config.shell.user, "root");
}

#[test]
fn default_locations_live_under_crunchy_dirs() {
    let options = LayeredConfigOptions::new("/srv");
    if let Some(user) = &options.user_config_path {
        assert!(user.ends_with(".crunchy/crunchy.json5"));
    }
    #[cfg(unix)]
    {
        assert_eq!(
            options.system_config_path.as_deref(),
            Some(Path::new("/etc/crunchy/crunchy.json5"))
        );
        assert_eq!(
            options.requirements_path.as_deref(),
            Some(Path::new("/etc/crunchy/requirements.json5"))
        );
    }
}

#[test]
fn partial_layer_reports_layer_label() {
    let temp = TempDir::new().expect("tmp");
    let runtime = temp.path().join("runtime.json5");
    write_json5(&runtime, r#"{ audit: { include_peer_in_filename: "yes" } }"#);
    let options = isolated_options(temp.path()).with_runtime_path(&runtime);
    let err = CrunchyConfig::load_layered_with_options(options).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("runtime("));
    assert!(msg.contains("audit.include_peer_in_filename"));
}

#[test]
fn builder_replaces_sections() {
    let config = CrunchyConfig::builder()
        .shell(crate::ShellConfig {
            strategy: ExecutionStrategyKind::MarkerRecovery,
            ..Default::default()
        })
        .build();
    assert_eq!(config.shell.strategy, ExecutionStrategyKind::MarkerRecovery);
    assert_eq!(config.sandbox.name_prefix, "crunchy");
}
