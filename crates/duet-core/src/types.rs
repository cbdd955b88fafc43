//! Common types for Duet
//!
//! Fundamental audio types shared by the loader, the DSP stages and the
//! render path: stereo samples, stem roles and route ids.

use serde::{Deserialize, Serialize};

/// Sample rate assumed when nothing else is known (CD rate, what most stems ship at)
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Number of stems in a session (instrumental + vocal)
pub const NUM_STEMS: usize = 2;

/// Number of output routes (headphones + stream)
pub const NUM_ROUTES: usize = 2;

/// Audio sample type (32-bit float for processing)
pub type Sample = f32;

/// Role of a stem within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(usize)]
pub enum StemRole {
    Instrumental = 0,
    Vocal = 1,
}

impl StemRole {
    /// All stems in render order
    pub const ALL: [StemRole; NUM_STEMS] = [StemRole::Instrumental, StemRole::Vocal];

    /// Index into per-stem arrays
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            StemRole::Instrumental => "instrumental",
            StemRole::Vocal => "vocal",
        }
    }
}

impl std::fmt::Display for StemRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Output route identifier
///
/// Route A is the performer's monitor mix (headphones), route B is the
/// capture/stream mix. Both render from the same transport position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum RouteId {
    /// Performer monitor (headphones)
    A = 0,
    /// Streaming / capture device
    B = 1,
}

impl RouteId {
    pub const ALL: [RouteId; NUM_ROUTES] = [RouteId::A, RouteId::B];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit used for this route in route masks
    #[inline]
    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// The other route of the pair
    pub fn other(self) -> Self {
        match self {
            RouteId::A => RouteId::B,
            RouteId::B => RouteId::A,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RouteId::A => "headphones",
            RouteId::B => "stream",
        }
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Linear interpolation between two samples (`t` in 0..=1)
    #[inline]
    pub fn lerp(self, other: Self, t: Sample) -> Self {
        Self {
            left: self.left + (other.left - self.left) * t,
            right: self.right + (other.right - self.right) * t,
        }
    }

    /// Clamp both channels to ±limit
    #[inline]
    pub fn clamp(self, limit: Sample) -> Self {
        Self {
            left: self.left.clamp(-limit, limit),
            right: self.right.clamp(-limit, limit),
        }
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// Convert decibels to a linear gain factor (`-inf` dB maps to exactly 0.0)
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    if db == f32::NEG_INFINITY {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_sample_operations() {
        let a = StereoSample::new(1.0, 2.0);
        let b = StereoSample::new(0.5, 0.5);

        let sum = a + b;
        assert_eq!(sum.left, 1.5);
        assert_eq!(sum.right, 2.5);

        let scaled = a * 0.5;
        assert_eq!(scaled.left, 0.5);
        assert_eq!(scaled.right, 1.0);

        let mid = StereoSample::silence().lerp(a, 0.5);
        assert_eq!(mid, StereoSample::new(0.5, 1.0));
    }

    #[test]
    fn test_route_helpers() {
        assert_eq!(RouteId::A.other(), RouteId::B);
        assert_eq!(RouteId::B.bit(), 0b10);
        assert_eq!(StemRole::Vocal.index(), 1);
    }

    #[test]
    fn test_db_conversion() {
        assert_eq!(db_to_linear(f32::NEG_INFINITY), 0.0);
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.501).abs() < 0.01);
    }
}
