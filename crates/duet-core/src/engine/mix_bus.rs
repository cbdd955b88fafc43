//! Route mix bus
//!
//! Sums gain-scaled stems into one stereo block, then hard-limits to ±1.0
//! full scale. The limiter is a last-resort safety stage against additive
//! overflow; it is lossy on purpose and its activity is reported.

use crate::types::StereoSample;

/// Output ceiling of the bus
pub const FULL_SCALE: f32 = 1.0;

/// Result of mixing one block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MixStats {
    /// Post-limiter peak per channel
    pub peak_left: f32,
    pub peak_right: f32,
    /// Samples (per channel) the limiter had to clamp
    pub clipped: usize,
}

/// Sum `(signal, linear gain)` pairs into `output`
///
/// Inputs with zero gain are skipped entirely, so a muted stem contributes
/// nothing, not even denormals. Inputs shorter than the output contribute
/// silence past their end.
pub fn mix_into(inputs: &[(&[StereoSample], f32)], output: &mut [StereoSample]) -> MixStats {
    output.fill(StereoSample::silence());

    for &(signal, gain) in inputs {
        if gain == 0.0 {
            continue;
        }
        for (out, &sample) in output.iter_mut().zip(signal) {
            *out += sample * gain;
        }
    }

    let mut stats = MixStats::default();
    for out in output.iter_mut() {
        if out.left.abs() > FULL_SCALE {
            stats.clipped += 1;
        }
        if out.right.abs() > FULL_SCALE {
            stats.clipped += 1;
        }
        *out = out.clamp(FULL_SCALE);
        stats.peak_left = stats.peak_left.max(out.left.abs());
        stats.peak_right = stats.peak_right.max(out.right.abs());
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale_sum_is_clamped() {
        let full: Vec<StereoSample> = (0..64)
            .map(|i| StereoSample::mono(if i % 2 == 0 { 1.0 } else { -1.0 }))
            .collect();
        let mut output = vec![StereoSample::silence(); 64];

        let stats = mix_into(&[(&full, 1.0), (&full, 1.0)], &mut output);

        assert!(output.iter().all(|s| s.left.abs() <= 1.0 && s.right.abs() <= 1.0));
        assert_eq!(output[0], StereoSample::mono(1.0));
        assert_eq!(output[1], StereoSample::mono(-1.0));
        assert_eq!(stats.clipped, 128);
        assert_eq!(stats.peak_left, 1.0);
    }

    #[test]
    fn test_gains_are_linear() {
        let a = vec![StereoSample::new(0.2, 0.1); 8];
        let b = vec![StereoSample::new(0.1, -0.1); 8];
        let mut output = vec![StereoSample::silence(); 8];

        let stats = mix_into(&[(&a, 0.5), (&b, 2.0)], &mut output);

        assert!((output[3].left - 0.3).abs() < 1e-6);
        assert!((output[3].right - -0.15).abs() < 1e-6);
        assert_eq!(stats.clipped, 0);
    }

    #[test]
    fn test_zero_gain_input_is_ignored() {
        let loud = vec![StereoSample::mono(0.9); 4];
        let nan = vec![StereoSample::mono(f32::NAN); 4];
        let mut output = vec![StereoSample::mono(0.7); 6];

        mix_into(&[(&loud, 0.5), (&nan, 0.0)], &mut output);

        assert!((output[0].left - 0.45).abs() < 1e-6);
        // Past the input's end: silence
        assert_eq!(output[5], StereoSample::silence());
    }
}
