//! Pitch shifting without tempo change
//!
//! [`PitchShifter`] wraps one of two algorithms behind a streaming,
//! block-in/block-out interface. Each (stem, route) pair owns its own
//! shifter, so phase memory never leaks between signals.
//!
//! A shift of exactly 0 semitones bypasses the algorithm entirely and is a
//! bit-exact identity. Entering or leaving bypass crossfades over one block.
//! On entry the algorithm is primed with the most recent input so the
//! crossfade lands on real audio instead of the algorithm's startup silence.

mod stretch;
mod vocoder;

use serde::{Deserialize, Serialize};

pub use stretch::SignalsmithShifter;
pub use vocoder::{PhaseVocoder, FRAME_SIZE, HOP_SIZE};

use crate::audio::MAX_BLOCK_SIZE;
use crate::types::StereoSample;

/// Lowest supported shift in semitones
pub const MIN_SEMITONES: f32 = -24.0;

/// Highest supported shift in semitones
pub const MAX_SEMITONES: f32 = 24.0;

/// Clamp a shift to the supported range; NaN maps to 0
pub fn clamp_semitones(semitones: f32) -> f32 {
    if semitones.is_nan() {
        0.0
    } else {
        semitones.clamp(MIN_SEMITONES, MAX_SEMITONES)
    }
}

/// Pitch shifting algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitchAlgorithm {
    /// Built-in STFT phase vocoder (2048/512)
    #[default]
    PhaseVocoder,
    /// signalsmith-stretch transposition
    Signalsmith,
}

enum Algorithm {
    Vocoder(Box<PhaseVocoder>),
    Signalsmith(Box<SignalsmithShifter>),
}

impl Algorithm {
    fn latency(&self) -> usize {
        match self {
            Algorithm::Vocoder(_) => PhaseVocoder::latency(),
            Algorithm::Signalsmith(s) => s.latency(),
        }
    }

    fn set_semitones(&mut self, semitones: f32) {
        match self {
            Algorithm::Vocoder(v) => v.set_semitones(semitones),
            Algorithm::Signalsmith(s) => s.set_semitones(semitones),
        }
    }

    fn reset(&mut self) {
        match self {
            Algorithm::Vocoder(v) => v.reset(),
            Algorithm::Signalsmith(s) => s.reset(),
        }
    }

    fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        match self {
            Algorithm::Vocoder(v) => v.process(input, output),
            Algorithm::Signalsmith(s) => s.process(input, output),
        }
    }
}

/// Streaming stereo pitch shifter
pub struct PitchShifter {
    algorithm: Algorithm,
    kind: PitchAlgorithm,
    semitones: f32,
    /// Whether the last block went through the algorithm
    engaged: bool,
    /// Most recent `latency` input frames, kept while bypassed
    history: Vec<StereoSample>,
    /// Scratch for the wet signal and for priming output
    wet: Vec<StereoSample>,
}

impl PitchShifter {
    pub fn new(kind: PitchAlgorithm, sample_rate: u32) -> Self {
        let algorithm = match kind {
            PitchAlgorithm::PhaseVocoder => Algorithm::Vocoder(Box::new(PhaseVocoder::new())),
            PitchAlgorithm::Signalsmith => {
                Algorithm::Signalsmith(Box::new(SignalsmithShifter::new(sample_rate)))
            }
        };
        let latency = algorithm.latency();

        Self {
            algorithm,
            kind,
            semitones: 0.0,
            engaged: false,
            history: vec![StereoSample::silence(); latency],
            wet: vec![StereoSample::silence(); MAX_BLOCK_SIZE.max(latency)],
        }
    }

    pub fn algorithm(&self) -> PitchAlgorithm {
        self.kind
    }

    /// Set the shift; takes effect on the next block
    pub fn set_semitones(&mut self, semitones: f32) {
        self.semitones = clamp_semitones(semitones);
        if self.semitones != 0.0 {
            self.algorithm.set_semitones(self.semitones);
        }
    }

    pub fn semitones(&self) -> f32 {
        self.semitones
    }

    /// Processing delay while shifting, in frames
    pub fn latency(&self) -> usize {
        self.history.len()
    }

    /// Forget all signal history (used after seeks)
    pub fn reset(&mut self) {
        self.algorithm.reset();
        self.history.fill(StereoSample::silence());
        self.engaged = false;
    }

    /// Pitch-shift `input` into `output`
    ///
    /// Processes `min(input.len(), output.len())` frames; output length is
    /// always the input length.
    pub fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        let len = input.len().min(output.len());
        for (inp, out) in input[..len]
            .chunks(MAX_BLOCK_SIZE)
            .zip(output[..len].chunks_mut(MAX_BLOCK_SIZE))
        {
            self.process_block(inp, out);
        }
    }

    fn process_block(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        let shifting = self.semitones != 0.0;
        match (self.engaged, shifting) {
            (false, false) => {
                output.copy_from_slice(input);
                self.remember(input);
            }
            (true, true) => self.algorithm.process(input, output),
            (false, true) => {
                self.prime();
                let n = input.len();
                self.algorithm.process(input, &mut self.wet[..n]);
                crossfade(input, &self.wet[..n], output);
                self.engaged = true;
            }
            (true, false) => {
                let n = input.len();
                self.algorithm.process(input, &mut self.wet[..n]);
                crossfade(&self.wet[..n], input, output);
                self.remember(input);
                self.engaged = false;
            }
        }
    }

    /// Feed the bypass history through a freshly reset algorithm
    fn prime(&mut self) {
        self.algorithm.reset();
        self.algorithm.set_semitones(self.semitones);
        let n = self.history.len();
        self.algorithm.process(&self.history, &mut self.wet[..n]);
    }

    /// Append input to the bypass history ring
    fn remember(&mut self, input: &[StereoSample]) {
        let keep = self.history.len();
        if input.len() >= keep {
            self.history
                .copy_from_slice(&input[input.len() - keep..]);
        } else {
            self.history.copy_within(input.len().., 0);
            let tail = keep - input.len();
            self.history[tail..].copy_from_slice(input);
        }
    }
}

/// Linear crossfade from `from` to `to` across the block
fn crossfade(from: &[StereoSample], to: &[StereoSample], output: &mut [StereoSample]) {
    let n = output.len();
    if n == 0 {
        return;
    }
    let step = 1.0 / n as f32;
    for (i, ((out, &a), &b)) in output.iter_mut().zip(from).zip(to).enumerate() {
        *out = a.lerp(b, (i + 1) as f32 * step);
    }
}
