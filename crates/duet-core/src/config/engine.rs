//! Engine configuration
//!
//! Persisted as YAML. Every field has a default so partial files work:
//!
//! ```yaml
//! buffer_size: !Fixed 256
//! sync:
//!   max_drift_ms: 20.0
//! routes:
//!   - device: { name: "Headphones", host: ALSA }
//!   - vocal: { gain_db: -.inf, muted: true }
//! ```

use serde::{Deserialize, Serialize};

use super::loudness::LoudnessConfig;
use crate::audio::BufferSize;
use crate::engine::RouteConfig;
use crate::pitch::PitchAlgorithm;
use crate::types::{RouteId, NUM_ROUTES};

/// Drift reconciliation tuning
///
/// Distances are compared against the estimated playback positions of the
/// two routes. A route ahead by more than `engage_ms` is slowed by
/// `nudge_ratio` until the gap falls under `release_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftPolicy {
    /// Drift the engine promises to stay under
    pub max_drift_ms: f32,
    /// Drift at which nudging starts
    pub engage_ms: f32,
    /// Drift at which nudging stops
    pub release_ms: f32,
    /// Fractional slow-down applied to the leading route
    pub nudge_ratio: f32,
    /// Reconciliation period
    pub interval_ms: u64,
    /// Consecutive ticks over `max_drift_ms` before a sync fault is raised
    pub fault_ticks: u32,
    /// Drift beyond which both routes are hard-resynced
    pub resync_ms: f32,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            max_drift_ms: 20.0,
            engage_ms: 5.0,
            release_ms: 1.0,
            nudge_ratio: 0.005,
            interval_ms: 50,
            fault_ticks: 40,
            resync_ms: 250.0,
        }
    }
}

impl DriftPolicy {
    /// Replace nonsensical values with defaults, keeping thresholds ordered
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let positive = |v: f32, d: f32| if v.is_finite() && v > 0.0 { v } else { d };

        let max_drift_ms = positive(self.max_drift_ms, defaults.max_drift_ms);
        let engage_ms = positive(self.engage_ms, defaults.engage_ms).min(max_drift_ms);
        let release_ms = positive(self.release_ms, defaults.release_ms).min(engage_ms);
        let resync_ms = positive(self.resync_ms, defaults.resync_ms).max(max_drift_ms);
        let nudge_ratio = if self.nudge_ratio.is_finite() {
            self.nudge_ratio.clamp(0.0001, 0.05)
        } else {
            defaults.nudge_ratio
        };

        Self {
            max_drift_ms,
            engage_ms,
            release_ms,
            nudge_ratio,
            interval_ms: self.interval_ms.clamp(5, 1000),
            fault_ticks: self.fault_ticks.max(1),
            resync_ms,
        }
    }

    /// Pitch deviation in cents while a route is being nudged
    pub fn max_artifact_cents(&self) -> f32 {
        -1200.0 * (1.0 - self.nudge_ratio).log2()
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session sample rate; `None` adopts the instrumental stem's rate
    pub reference_sample_rate: Option<u32>,
    /// Preferred device buffer size for both routes
    pub buffer_size: BufferSize,
    pub sync: DriftPolicy,
    pub loudness: LoudnessConfig,
    pub pitch_algorithm: PitchAlgorithm,
    /// Initial configuration for route A (headphones) and route B (stream)
    pub routes: Vec<RouteConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reference_sample_rate: None,
            buffer_size: BufferSize::default(),
            sync: DriftPolicy::default(),
            loudness: LoudnessConfig::default(),
            pitch_algorithm: PitchAlgorithm::default(),
            routes: vec![RouteConfig::headphones(), RouteConfig::stream()],
        }
    }
}

impl EngineConfig {
    /// Initial configuration for a route, falling back to its default mix
    pub fn route(&self, route: RouteId) -> RouteConfig {
        self.routes
            .get(route.index())
            .cloned()
            .unwrap_or_else(|| RouteConfig::default_for(route))
    }

    /// Route configs as a fixed array, one per route
    pub fn route_configs(&self) -> [RouteConfig; NUM_ROUTES] {
        [self.route(RouteId::A), self.route(RouteId::B)]
    }
}
