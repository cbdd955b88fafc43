//! YAML configuration I/O
//!
//! Generic load/save helpers for any serde configuration type. The lenient
//! loader never fails: a missing or malformed file falls back to defaults so
//! a broken settings file can't keep the player from starting.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load a configuration file, falling back to `T::default()`
///
/// A missing file is normal on first start and logged at info level;
/// unreadable or unparsable files are logged as warnings.
///
/// ```ignore
/// let config: EngineConfig = load_config(&default_config_path());
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("No config at {:?}, using defaults", path);
        return T::default();
    }

    match load_config_strict(path) {
        Ok(config) => {
            log::info!("Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("Ignoring config {:?}: {:#}", path, e);
            T::default()
        }
    }
}

/// Load a configuration file, reporting every failure
///
/// Used when the user names a config file explicitly and a silent fallback
/// would hide their mistake.
pub fn load_config_strict<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Invalid YAML in {:?}", path))
}

/// Save a configuration as YAML, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("Saved config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        target: f32,
        device: Option<String>,
    }

    #[test]
    fn test_missing_file_yields_default() {
        let config: Sample = load_config(Path::new("/nonexistent/duet/engine.yaml"));
        assert_eq!(config, Sample::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.yaml");

        let config = Sample {
            target: -16.0,
            device: Some("USB Audio".to_string()),
        };
        save_config(&config, &path).unwrap();

        let loaded: Sample = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_file_lenient_and_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "target: [not, a, number").unwrap();

        let lenient: Sample = load_config(&path);
        assert_eq!(lenient, Sample::default());

        let strict: Result<Sample> = load_config_strict(&path);
        assert!(strict.is_err());
    }
}
