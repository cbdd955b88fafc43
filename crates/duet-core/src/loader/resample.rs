//! Load-time sample rate conversion
//!
//! Stems are converted once, before playback, with a windowed-sinc
//! resampler. Output length is `round(frames * to / from)` and the filter
//! delay is trimmed so stems stay frame-aligned with each other.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::types::StereoSample;

/// Input frames per resampler call
const CHUNK_SIZE: usize = 1024;

fn sinc_params() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

/// Number of frames `frames` becomes at the target rate
pub fn resampled_len(frames: usize, from: u32, to: u32) -> usize {
    (frames as f64 * to as f64 / from as f64).round() as usize
}

/// Convert a stereo signal from `from` Hz to `to` Hz
pub fn resample_stereo(
    samples: &[StereoSample],
    from: u32,
    to: u32,
) -> Result<Vec<StereoSample>, String> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from == 0 || to == 0 {
        return Err(format!("invalid sample rate conversion {} -> {}", from, to));
    }

    let ratio = to as f64 / from as f64;
    let target_len = resampled_len(samples.len(), from, to);

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, sinc_params(), CHUNK_SIZE, 2)
        .map_err(|e| e.to_string())?;
    let delay = resampler.output_delay();

    let left: Vec<f32> = samples.iter().map(|s| s.left).collect();
    let right: Vec<f32> = samples.iter().map(|s| s.right).collect();

    let mut out_left = Vec::with_capacity(target_len + delay + CHUNK_SIZE);
    let mut out_right = Vec::with_capacity(target_len + delay + CHUNK_SIZE);

    let mut pos = 0;
    while pos + CHUNK_SIZE <= left.len() {
        let input = [&left[pos..pos + CHUNK_SIZE], &right[pos..pos + CHUNK_SIZE]];
        let output = resampler.process(&input[..], None).map_err(|e| e.to_string())?;
        out_left.extend_from_slice(&output[0]);
        out_right.extend_from_slice(&output[1]);
        pos += CHUNK_SIZE;
    }

    if pos < left.len() {
        let input = [&left[pos..], &right[pos..]];
        let output = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(|e| e.to_string())?;
        out_left.extend_from_slice(&output[0]);
        out_right.extend_from_slice(&output[1]);
    }

    // Flush the filter until the delayed tail is out
    while out_left.len() < target_len + delay {
        let output = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| e.to_string())?;
        if output[0].is_empty() {
            break;
        }
        out_left.extend_from_slice(&output[0]);
        out_right.extend_from_slice(&output[1]);
    }

    let mut result: Vec<StereoSample> = out_left
        .iter()
        .zip(&out_right)
        .skip(delay)
        .take(target_len)
        .map(|(&l, &r)| StereoSample::new(l, r))
        .collect();
    result.resize(target_len, StereoSample::silence());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, frames: usize) -> Vec<StereoSample> {
        (0..frames)
            .map(|i| {
                let t = i as f32 / rate as f32;
                StereoSample::mono(0.5 * (2.0 * std::f32::consts::PI * freq * t).sin())
            })
            .collect()
    }

    #[test]
    fn test_same_rate_is_copy() {
        let input = sine(440.0, 44100, 1000);
        assert_eq!(resample_stereo(&input, 44100, 44100).unwrap(), input);
    }

    #[test]
    fn test_output_length() {
        let input = sine(440.0, 48000, 48000 + 123);
        let output = resample_stereo(&input, 48000, 44100).unwrap();
        assert_eq!(output.len(), resampled_len(input.len(), 48000, 44100));

        let output = resample_stereo(&input[..500], 48000, 96000).unwrap();
        assert_eq!(output.len(), 1000);
    }

    #[test]
    fn test_signal_stays_aligned() {
        let input = sine(440.0, 48000, 48000);
        let output = resample_stereo(&input, 48000, 44100).unwrap();

        // Compare against the ideal signal in the middle of the buffer
        let expected = sine(440.0, 44100, output.len());
        let error = output[10_000..30_000]
            .iter()
            .zip(&expected[10_000..30_000])
            .map(|(a, b)| (a.left - b.left).abs())
            .fold(0.0f32, f32::max);
        assert!(error < 0.05, "max error {}", error);
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        let input = sine(440.0, 48000, 100);
        assert!(resample_stereo(&input, 0, 44100).is_err());
    }
}
