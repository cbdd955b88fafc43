//! Default locations for Duet configuration files

use std::path::PathBuf;

/// File name of the engine configuration
pub const ENGINE_CONFIG_FILE: &str = "engine.yaml";

/// Per-user configuration directory
///
/// Returns `$XDG_CONFIG_HOME/duet` (or the platform equivalent), falling back
/// to `./duet` when the platform reports no config directory.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("duet")
}

/// Default engine config path: `{config_dir}/duet/engine.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(ENGINE_CONFIG_FILE)
}
