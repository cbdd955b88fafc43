//! Configuration for the Duet engine
//!
//! - Generic YAML config loading/saving
//! - Default config locations
//! - Loudness matching, drift reconciliation and engine settings
//!
//! ```ignore
//! use duet_core::config::{default_config_path, load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&default_config_path());
//! ```

mod engine;
mod io;
mod loudness;
mod paths;

pub use engine::{DriftPolicy, EngineConfig};
pub use io::{load_config, load_config_strict, save_config};
pub use loudness::{LoudnessConfig, MAX_TARGET_LUFS, MIN_TARGET_LUFS};
pub use paths::{default_config_dir, default_config_path, ENGINE_CONFIG_FILE};
