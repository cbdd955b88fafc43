//! Pitch shifting via signalsmith-stretch
//!
//! Input and output blocks are the same length, so the stretcher only
//! transposes. Higher quality than the phase vocoder on polyphonic material
//! at a higher CPU cost.

use signalsmith_stretch::Stretch;

use crate::types::StereoSample;

const CHANNELS: u32 = 2;

pub struct SignalsmithShifter {
    stretcher: Stretch,
    semitones: f32,
}

impl SignalsmithShifter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            stretcher: Stretch::preset_default(CHANNELS, sample_rate),
            semitones: 0.0,
        }
    }

    pub fn set_semitones(&mut self, semitones: f32) {
        if semitones != self.semitones {
            self.semitones = semitones;
            // No tonality limit: formants move with the pitch
            self.stretcher.set_transpose_factor_semitones(semitones, None);
        }
    }

    pub fn semitones(&self) -> f32 {
        self.semitones
    }

    /// Total delay in frames
    pub fn latency(&self) -> usize {
        self.stretcher.input_latency() + self.stretcher.output_latency()
    }

    pub fn reset(&mut self) {
        self.stretcher.reset();
        self.stretcher
            .set_transpose_factor_semitones(self.semitones, None);
    }

    /// Transpose `input` into `output`; both are treated as interleaved f32
    pub fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        let len = input.len().min(output.len());
        let input = bytemuck::cast_slice::<StereoSample, f32>(&input[..len]);
        let output = bytemuck::cast_slice_mut::<StereoSample, f32>(&mut output[..len]);
        output.fill(0.0);
        self.stretcher.process(input, output);
    }
}
