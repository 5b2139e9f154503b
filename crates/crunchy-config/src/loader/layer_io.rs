//! Locating and reading individual config layers.

use super::{
    ConfigLayer, ConfigLayerSource, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE, LoadedLayer,
    SchemaMode, schema,
};
use crate::ConfigError;
use directories::UserDirs;
use log::debug;
use serde_json::{Map, Value};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[cfg(unix)]
/// Operator-wide config directory.
const SYSTEM_DIR: &str = "/etc/crunchy";
/// File in the system directory whose keys later layers cannot override.
const REQUIREMENTS_FILE: &str = "requirements.json5";

/// Whether a missing layer file is skipped or reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Presence {
    Optional,
    Required,
}

/// Default layer locations on this host.
#[derive(Debug, Clone, Default)]
pub(super) struct DefaultLocations {
    pub(super) requirements: Option<PathBuf>,
    pub(super) system: Option<PathBuf>,
    pub(super) user: Option<PathBuf>,
}

impl DefaultLocations {
    pub(super) fn discover() -> Self {
        let system_dir = system_dir();
        Self {
            requirements: system_dir.as_ref().map(|dir| dir.join(REQUIREMENTS_FILE)),
            system: system_dir.map(|dir| dir.join(DEFAULT_CONFIG_FILE)),
            user: UserDirs::new().map(|dirs| {
                dirs.home_dir()
                    .join(DEFAULT_CONFIG_DIR)
                    .join(DEFAULT_CONFIG_FILE)
            }),
        }
    }
}

#[cfg(unix)]
fn system_dir() -> Option<PathBuf> {
    Some(PathBuf::from(SYSTEM_DIR))
}

#[cfg(not(unix))]
fn system_dir() -> Option<PathBuf> {
    None
}

impl fmt::Display for ConfigLayerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requirements => "requirements",
            Self::System => "system",
            Self::User => "user",
            Self::Cwd => "cwd",
            Self::Runtime => "runtime",
        })
    }
}

/// Read one layer and check it against the partial schema.
///
/// A missing optional file yields `Ok(None)`; a blank file is an empty layer.
pub(super) fn read_layer(
    source: ConfigLayerSource,
    path: &Path,
    presence: Presence,
) -> Result<Option<LoadedLayer>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound && presence == Presence::Optional => {
            debug!(
                "config layer absent (source={}, path={})",
                source,
                path.display()
            );
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let value = if contents.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        json5::from_str(&contents)?
    };
    let label = format!("{source}({})", path.display());
    schema::validate_layer_schema(&value, SchemaMode::Partial, &label)?;
    debug!(
        "config layer read (source={}, path={})",
        source,
        path.display()
    );
    Ok(Some(LoadedLayer {
        meta: ConfigLayer {
            source,
            path: Some(path.to_path_buf()),
        },
        value,
    }))
}
