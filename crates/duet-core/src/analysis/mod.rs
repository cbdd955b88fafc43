//! Offline audio analysis run at session load

mod loudness;

pub use loudness::integrated_lufs;

use crate::types::{StereoSample, NUM_STEMS};

/// Measure both stems of a session in parallel
pub fn measure_stems(stems: [&[StereoSample]; NUM_STEMS], sample_rate: u32) -> [Option<f32>; NUM_STEMS] {
    let (a, b) = rayon::join(
        || integrated_lufs(stems[0], sample_rate),
        || integrated_lufs(stems[1], sample_rate),
    );
    [a, b]
}
