//! CLI configuration.
//!
//! Stored as TOML:
//! - `$XDG_CONFIG_HOME/deltapush/config.toml`, else `~/.config/deltapush/config.toml`
//! - Windows: `%APPDATA%/deltapush/config.toml`

use std::path::{Path, PathBuf};

use anyhow::Context;
use deltapush_publish::PublishConfig;
use deltapush_remote::RemoteConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const APP_DIR: &str = "deltapush";
const FILE_NAME: &str = "config.toml";

/// Contents of `config.toml`. Every table and key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub remote: RemoteConfig,
    pub publish: PublishConfig,
}

impl CliConfig {
    /// Loads `path`, or the per-user file when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("no config directory found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parses the TOML file at `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    config_path_from(
        std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
        std::env::var_os("APPDATA").map(PathBuf::from),
    )
}

fn config_path_from(
    xdg_config_home: Option<PathBuf>,
    home: Option<PathBuf>,
    appdata: Option<PathBuf>,
) -> Option<PathBuf> {
    let base = if cfg!(windows) {
        appdata.or(xdg_config_home)
    } else {
        xdg_config_home
            .filter(|p| p.is_absolute())
            .or_else(|| home.map(|h| h.join(".config")))
    }?;
    Some(base.join(APP_DIR).join(FILE_NAME))
}
