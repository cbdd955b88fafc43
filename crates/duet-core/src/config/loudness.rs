//! Loudness matching configuration
//!
//! Each stem is measured once at load time (integrated LUFS) and given a
//! static trim that moves it toward a target loudness. This module holds the
//! target and the safety limits on that trim.

use serde::{Deserialize, Serialize};

use crate::types::db_to_linear;

/// Lowest target loudness accepted from configuration
pub const MIN_TARGET_LUFS: f32 = -70.0;

/// Highest target loudness accepted from configuration
pub const MAX_TARGET_LUFS: f32 = 0.0;

/// Loudness matching settings
///
/// A backing track mastered at -8 LUFS and an isolated vocal at -22 LUFS
/// are brought to a common reference so the per-route gain faders start
/// from comparable levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoudnessConfig {
    /// Target integrated loudness in LUFS (default -14, typical streaming level)
    pub target_lufs: f32,

    /// When disabled every trim is 0 dB
    pub auto_gain_enabled: bool,

    /// Maximum boost in dB, limits gain on near-silent stems
    pub max_gain_db: f32,

    /// Maximum cut in dB
    pub min_gain_db: f32,
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        Self {
            target_lufs: -14.0,
            auto_gain_enabled: true,
            max_gain_db: 24.0,
            min_gain_db: -24.0,
        }
    }
}

impl LoudnessConfig {
    /// Trim in dB for a stem measured at `measured_lufs` against `target_lufs`
    ///
    /// Returns 0 dB when auto gain is off or the stem had no gated loudness
    /// (silence, or shorter than one measurement block).
    ///
    /// ```
    /// use duet_core::config::LoudnessConfig;
    ///
    /// let config = LoudnessConfig::default();
    /// // Stem at -20 LUFS, target -14 LUFS: +6 dB
    /// assert!((config.trim_db(-14.0, Some(-20.0)) - 6.0).abs() < 1e-6);
    /// ```
    pub fn trim_db(&self, target_lufs: f32, measured_lufs: Option<f32>) -> f32 {
        if !self.auto_gain_enabled {
            return 0.0;
        }
        match measured_lufs {
            Some(lufs) if lufs.is_finite() => {
                (target_lufs - lufs).clamp(self.min_gain_db, self.max_gain_db)
            }
            _ => 0.0,
        }
    }

    /// Trim in dB against the configured default target
    pub fn default_trim_db(&self, measured_lufs: Option<f32>) -> f32 {
        self.trim_db(self.target_lufs, measured_lufs)
    }

    /// Linear trim multiplier (1.0 = unity)
    pub fn trim_linear(&self, target_lufs: f32, measured_lufs: Option<f32>) -> f32 {
        db_to_linear(self.trim_db(target_lufs, measured_lufs))
    }
}
