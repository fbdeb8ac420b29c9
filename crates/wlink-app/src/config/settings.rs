//! Settings file loading

use std::path::{Path, PathBuf};

use wlink_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = "widget-link";

// ─────────────────────────────────────────────────────────────────────────────
// Settings Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Default settings location: `<config dir>/widget-link/config.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Load and validate settings from `path`
///
/// Unlike most of this crate, a bad settings file is not retried: the
/// connection cannot start without credentials.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let settings = parse_settings(&content)?;
    debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

/// Parse and validate settings from TOML source
pub fn parse_settings(content: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(content)
        .map_err(|e| Error::config_invalid(format!("failed to parse settings: {e}")))?;
    settings.connection.validate()?;
    Ok(settings)
}
