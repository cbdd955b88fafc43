//! Per-route mix configuration
//!
//! [`RouteConfig`] is what the control surface edits. Before it reaches a
//! renderer it is validated and resolved against the session's measured
//! loudness into an immutable [`RouteSnapshot`], which is swapped in
//! atomically so a render callback never sees half an update.

use serde::{Deserialize, Serialize};

use crate::audio::DeviceId;
use crate::config::{LoudnessConfig, MAX_TARGET_LUFS, MIN_TARGET_LUFS};
use crate::error::ConfigError;
use crate::pitch::{MAX_SEMITONES, MIN_SEMITONES};
use crate::types::{db_to_linear, RouteId, StemRole, NUM_STEMS};

/// Highest per-stem route gain in dB
pub const MAX_STEM_GAIN_DB: f32 = 12.0;

/// Gain of one stem on one route
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemGain {
    /// Gain in dB; `-inf` is silence
    pub gain_db: f32,
    pub muted: bool,
}

impl Default for StemGain {
    fn default() -> Self {
        Self {
            gain_db: 0.0,
            muted: false,
        }
    }
}

impl StemGain {
    pub fn db(gain_db: f32) -> Self {
        Self {
            gain_db,
            muted: false,
        }
    }

    pub fn muted() -> Self {
        Self {
            gain_db: 0.0,
            muted: true,
        }
    }

    /// Linear multiplier, 0.0 when muted or at -inf dB
    pub fn linear(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            db_to_linear(self.gain_db)
        }
    }
}

/// Mix settings for one output route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub instrumental: StemGain,
    pub vocal: StemGain,
    /// Transposition in semitones
    ///
    /// Both routes must stay in tune with each other, so the engine applies
    /// the most recently configured value to both.
    pub pitch_semitones: f32,
    /// Loudness reference for the stem trims; `None` uses the engine default
    pub target_lufs: Option<f32>,
    /// Output device; `None` is the system default
    pub device: Option<DeviceId>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self::headphones()
    }
}

impl RouteConfig {
    /// Performer monitor: instrumental and vocal at unity
    pub fn headphones() -> Self {
        Self {
            instrumental: StemGain::default(),
            vocal: StemGain::default(),
            pitch_semitones: 0.0,
            target_lufs: None,
            device: None,
        }
    }

    /// Stream capture: instrumental only
    pub fn stream() -> Self {
        Self {
            vocal: StemGain::muted(),
            ..Self::headphones()
        }
    }

    pub fn default_for(route: RouteId) -> Self {
        match route {
            RouteId::A => Self::headphones(),
            RouteId::B => Self::stream(),
        }
    }

    pub fn stem(&self, role: StemRole) -> &StemGain {
        match role {
            StemRole::Instrumental => &self.instrumental,
            StemRole::Vocal => &self.vocal,
        }
    }

    pub fn stem_mut(&mut self, role: StemRole) -> &mut StemGain {
        match role {
            StemRole::Instrumental => &mut self.instrumental,
            StemRole::Vocal => &mut self.vocal,
        }
    }

    /// Check and normalize a configuration
    ///
    /// NaN values have no safe substitute and are rejected. Finite values
    /// outside the supported ranges are clamped with a warning. A target
    /// loudness outside [-70, 0] LUFS is rejected: clamping a typo like
    /// `+14` to 0 LUFS would blast the route.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        for role in StemRole::ALL {
            let gain = self.stem_mut(role);
            if gain.gain_db.is_nan() {
                return Err(ConfigError::InvalidGain {
                    stem: role,
                    value: gain.gain_db,
                });
            }
            if gain.gain_db > MAX_STEM_GAIN_DB {
                log::warn!(
                    "Clamping {} gain {}dB to {}dB",
                    role,
                    gain.gain_db,
                    MAX_STEM_GAIN_DB
                );
                gain.gain_db = MAX_STEM_GAIN_DB;
            }
        }

        if self.pitch_semitones.is_nan() {
            return Err(ConfigError::InvalidPitch(self.pitch_semitones));
        }
        if !(MIN_SEMITONES..=MAX_SEMITONES).contains(&self.pitch_semitones) {
            let clamped = self.pitch_semitones.clamp(MIN_SEMITONES, MAX_SEMITONES);
            log::warn!(
                "Clamping pitch shift {} to {} semitones",
                self.pitch_semitones,
                clamped
            );
            self.pitch_semitones = clamped;
        }

        if let Some(target) = self.target_lufs {
            if !(MIN_TARGET_LUFS..=MAX_TARGET_LUFS).contains(&target) {
                return Err(ConfigError::InvalidTargetLufs(target));
            }
        }

        Ok(self)
    }
}

/// Resolved, immutable mix state read by a renderer each block
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSnapshot {
    /// Linear gain per stem, route gain times loudness trim
    pub gains: [f32; NUM_STEMS],
    /// Loudness trim per stem in dB
    pub trims_db: [f32; NUM_STEMS],
    pub pitch_semitones: f32,
}

impl Default for RouteSnapshot {
    fn default() -> Self {
        Self {
            gains: [1.0; NUM_STEMS],
            trims_db: [0.0; NUM_STEMS],
            pitch_semitones: 0.0,
        }
    }
}

impl RouteSnapshot {
    /// Combine a validated config with the session's loudness measurements
    pub fn resolve(
        config: &RouteConfig,
        stem_lufs: [Option<f32>; NUM_STEMS],
        loudness: &LoudnessConfig,
    ) -> Self {
        let target = config.target_lufs.unwrap_or(loudness.target_lufs);
        let mut gains = [0.0; NUM_STEMS];
        let mut trims_db = [0.0; NUM_STEMS];

        for role in StemRole::ALL {
            let i = role.index();
            trims_db[i] = loudness.trim_db(target, stem_lufs[i]);
            gains[i] = config.stem(role).linear() * db_to_linear(trims_db[i]);
        }

        Self {
            gains,
            trims_db,
            pitch_semitones: config.pitch_semitones,
        }
    }

    /// Whether a stem contributes to this route at all
    #[inline]
    pub fn is_active(&self, role: StemRole) -> bool {
        self.gains[role.index()] > 0.0
    }
}
