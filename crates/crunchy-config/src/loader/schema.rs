//! Schema validation helpers for Crunchy JSON5 configuration.

use super::SchemaMode;
use crate::{ConfigError, SANDBOX_PROVIDERS};
use serde_json::{Map, Value};

/// Validate a single config layer against the schema.
pub(super) fn validate_layer_schema(
    value: &Value,
    mode: SchemaMode,
    layer: &str,
) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    ensure_allowed_keys(
        map,
        &["$schema", "server", "sandbox", "shell", "audit"],
        layer,
        "",
    )?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("server") {
        validate_server(value, layer, "server")?;
    }
    if let Some(value) = map.get("sandbox") {
        validate_sandbox(value, mode, layer, "sandbox")?;
    }
    if let Some(value) = map.get("shell") {
        validate_shell(value, layer, "shell")?;
    }
    if let Some(value) = map.get("audit") {
        validate_audit(value, layer, "audit")?;
    }
    Ok(())
}

/// Validate the "server" block.
fn validate_server(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "listen",
            "telnet",
            "negotiation_timeout_ms",
            "login_prompt",
            "banner",
        ],
        layer,
        path,
    )?;

    for key in ["listen", "banner"] {
        if let Some(value) = map.get(key) {
            expect_string(value, layer, &join_path(path, key))?;
        }
    }
    for key in ["telnet", "login_prompt"] {
        if let Some(value) = map.get(key) {
            expect_bool(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("negotiation_timeout_ms") {
        expect_u64(value, layer, &join_path(path, "negotiation_timeout_ms"))?;
    }
    Ok(())
}

/// Validate the "sandbox" block.
///
/// Provider names are only checked on the effective config so a partial layer
/// may be combined with a locked requirement.
fn validate_sandbox(
    value: &Value,
    mode: SchemaMode,
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "provider",
            "image",
            "name_prefix",
            "snapshot_root",
            "network",
            "limits",
        ],
        layer,
        path,
    )?;

    if let Some(value) = map.get("provider") {
        let provider_path = join_path(path, "provider");
        let Some(provider) = value.as_str() else {
            return Err(invalid_field(layer, &provider_path, "expected string"));
        };
        if mode == SchemaMode::Full && !SANDBOX_PROVIDERS.contains(&provider) {
            return Err(invalid_field(
                layer,
                &provider_path,
                "unknown sandbox provider",
            ));
        }
    }
    for key in ["image", "name_prefix", "snapshot_root"] {
        if let Some(value) = map.get(key) {
            expect_string(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("network") {
        expect_bool(value, layer, &join_path(path, "network"))?;
    }
    if let Some(value) = map.get("limits") {
        validate_sandbox_limits(value, layer, &join_path(path, "limits"))?;
    }
    Ok(())
}

fn validate_sandbox_limits(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &["cpu_seconds", "memory_bytes", "nofile", "pids", "cpus"],
        layer,
        path,
    )?;

    for key in ["cpu_seconds", "memory_bytes", "nofile", "pids"] {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("cpus") {
        expect_f64(value, layer, &join_path(path, "cpus"))?;
    }
    Ok(())
}

/// Validate the "shell" block.
fn validate_shell(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "strategy",
            "terminal",
            "user",
            "hostname",
            "home",
            "start_dir",
            "shell_path",
            "path",
            "term",
            "command_timeout_secs",
            "max_output_bytes",
            "kill_timeout_ms",
            "exit_commands",
            "crlf",
        ],
        layer,
        path,
    )?;

    if let Some(value) = map.get("strategy") {
        expect_one_of(
            value,
            &["explicit_directory", "marker_recovery"],
            layer,
            &join_path(path, "strategy"),
            "invalid execution strategy",
        )?;
    }
    if let Some(value) = map.get("terminal") {
        expect_one_of(
            value,
            &["auto", "never"],
            layer,
            &join_path(path, "terminal"),
            "invalid terminal mode",
        )?;
    }
    for key in [
        "user",
        "hostname",
        "home",
        "start_dir",
        "shell_path",
        "path",
        "term",
    ] {
        if let Some(value) = map.get(key) {
            expect_string(value, layer, &join_path(path, key))?;
        }
    }
    for key in ["command_timeout_secs", "max_output_bytes", "kill_timeout_ms"] {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("exit_commands") {
        validate_string_array(value, layer, &join_path(path, "exit_commands"))?;
    }
    if let Some(value) = map.get("crlf") {
        expect_bool(value, layer, &join_path(path, "crlf"))?;
    }
    Ok(())
}

/// Validate the "audit" block.
fn validate_audit(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &["dir", "include_peer_in_filename", "auth_log"],
        layer,
        path,
    )?;

    for key in ["dir", "auth_log"] {
        if let Some(value) = map.get(key) {
            expect_string(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("include_peer_in_filename") {
        expect_bool(value, layer, &join_path(path, "include_peer_in_filename"))?;
    }
    Ok(())
}

/// Expect a JSON object or return a typed error.
fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(invalid_field(layer, path, "expected object")),
    }
}

fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_string() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected string"))
    }
}

fn expect_one_of(
    value: &Value,
    allowed: &[&str],
    layer: &str,
    path: &str,
    message: &str,
) -> Result<(), ConfigError> {
    match value.as_str() {
        Some(text) if allowed.contains(&text) => Ok(()),
        Some(_) => Err(invalid_field(layer, path, message)),
        None => Err(invalid_field(layer, path, "expected string")),
    }
}

fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_boolean() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected bool"))
    }
}

/// Expect a non-negative JSON integer.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

fn expect_f64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_number() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected number"))
    }
}

/// Validate that a value is an array of strings.
fn validate_string_array(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let Value::Array(entries) = value else {
        return Err(invalid_field(layer, path, "expected array"));
    };
    for (idx, entry) in entries.iter().enumerate() {
        if !entry.is_string() {
            return Err(invalid_field(
                layer,
                &format!("{path}[{idx}]"),
                "expected string",
            ));
        }
    }
    Ok(())
}

/// Ensure an object contains only allowed keys.
fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(invalid_field(layer, &join_path(path, key), "unknown key")),
        None => Ok(()),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Build a structured invalid-field error.
fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    let path = if path.is_empty() { "root" } else { path };
    ConfigError::InvalidField {
        path: format!("{layer}:{path}"),
        message: message.to_string(),
    }
}
