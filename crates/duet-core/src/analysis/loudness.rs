//! Integrated loudness (ITU-R BS.1770 / EBU R128)
//!
//! Measured with `ebur128` in integrated mode: K-weighting, 400ms gating
//! blocks, then the absolute (-70 LUFS) and relative (-10 LU) gates. Runs
//! once per stem at load time, never on the render path.

use ebur128::{EbuR128, Mode};

use crate::types::StereoSample;

/// Measure the integrated loudness of a stereo buffer
///
/// Returns `None` when no block survives the gates: digital silence, or
/// audio shorter than one 400ms block.
pub fn integrated_lufs(samples: &[StereoSample], sample_rate: u32) -> Option<f32> {
    let mut meter = match EbuR128::new(2, sample_rate, Mode::I) {
        Ok(meter) => meter,
        Err(e) => {
            log::warn!("Loudness meter unavailable at {}Hz: {:?}", sample_rate, e);
            return None;
        }
    };

    // [L, R, L, R, ...] without copying
    let interleaved: &[f32] = bytemuck::cast_slice(samples);
    if let Err(e) = meter.add_frames_f32(interleaved) {
        log::warn!("Loudness measurement failed: {:?}", e);
        return None;
    }

    meter
        .loudness_global()
        .ok()
        .filter(|lufs| lufs.is_finite())
        .map(|lufs| lufs as f32)
}
