//! Service settings, loaded from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub engine: EngineSettings,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// `;`-separated `key=value` pairs. `Data Source` must be the engine's
    /// HTTP(S) XMLA endpoint; `Initial Catalog`, `User ID` and `Password`
    /// are optional.
    pub connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureSettings {
    /// XMLA create command for the trace. The trace id is read from its
    /// ObjectDefinition/Trace/ID element.
    pub template_path: PathBuf,
    /// Root directory for the date-partitioned JSONL output.
    pub output_root: PathBuf,
}

impl Settings {
    /// Loads settings from `path`. Relative paths inside the file are
    /// resolved against the file's own directory, so a deployment can be
    /// moved as one unit.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings =
            toml::from_str(&text).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        if let Some(base) = path.parent() {
            settings.capture.template_path = resolve_from(base, &settings.capture.template_path);
            settings.capture.output_root = resolve_from(base, &settings.capture.output_root);
        }
        Ok(settings)
    }
}

fn resolve_from(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
