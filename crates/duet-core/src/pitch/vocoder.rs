//! Streaming phase vocoder pitch shifter
//!
//! Short-time Fourier analysis with a 2048-point periodic Hann window and a
//! hop of 512 (4x overlap). Each bin's true frequency is recovered from its
//! phase advance. Spectral peaks are then moved to their shifted frequency
//! together with the bins around them (identity phase locking), so a
//! partial keeps its window shape and its energy. A slow linked-stereo level
//! follower matches the output energy to the input, which keeps noisy
//! material from dropping in level where overlapping frames lose
//! coherence. Samples flow through per-channel FIFOs so any block size
//! works and output length always equals input length, delayed by
//! [`PhaseVocoder::latency`] frames.

use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::types::StereoSample;

/// Analysis frame size in samples
pub const FRAME_SIZE: usize = 2048;

/// Hop between analysis frames in samples
pub const HOP_SIZE: usize = 512;

const OVERSAMPLING: usize = FRAME_SIZE / HOP_SIZE;
const BINS: usize = FRAME_SIZE / 2 + 1;

/// Bins quieter than this are never treated as peaks
const PEAK_FLOOR: f32 = 1e-9;

/// Per-hop smoothing of the level follower (about 60ms at 44.1kHz)
const LEVEL_SMOOTHING: f32 = 0.8;

/// Largest correction the level follower applies, either way
const MAX_LEVEL_CORRECTION: f32 = 2.0;

const LEVEL_EPSILON: f32 = 1e-9;

/// Wrap a phase to `[-π, π)`
#[inline]
fn wrap_phase(phase: f32) -> f32 {
    (phase + PI).rem_euclid(2.0 * PI) - PI
}

/// Linear interpolation into `values` at a fractional index
#[inline]
fn interpolate(values: &[f32], position: f32) -> f32 {
    let last = values.len() - 1;
    let position = position.clamp(0.0, last as f32);
    let i = position as usize;
    let next = values[(i + 1).min(last)];
    values[i] + (next - values[i]) * (position - i as f32)
}

#[inline]
fn energy(samples: &[f32]) -> f32 {
    samples.iter().map(|x| x * x).sum()
}

/// Per-channel FIFOs and phase memory
struct ChannelState {
    in_fifo: Vec<f32>,
    out_fifo: Vec<f32>,
    accum: Vec<f32>,
    last_phase: Vec<f32>,
    /// Synthesis phase of the partial that covered each output bin last frame
    theta: Vec<f32>,
    locked: Vec<bool>,
    next_theta: Vec<f32>,
    next_locked: Vec<bool>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            in_fifo: vec![0.0; FRAME_SIZE],
            out_fifo: vec![0.0; HOP_SIZE],
            accum: vec![0.0; FRAME_SIZE],
            last_phase: vec![0.0; BINS],
            theta: vec![0.0; BINS],
            locked: vec![false; BINS],
            next_theta: vec![0.0; BINS],
            next_locked: vec![false; BINS],
        }
    }

    fn reset(&mut self) {
        self.in_fifo.fill(0.0);
        self.out_fifo.fill(0.0);
        self.accum.fill(0.0);
        self.last_phase.fill(0.0);
        self.theta.fill(0.0);
        self.locked.fill(false);
    }
}

/// FFT plans and scratch shared by both channels
struct Spectral {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    window: Vec<f32>,
    time: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    ana_mag: Vec<f32>,
    ana_phase: Vec<f32>,
    ana_freq: Vec<f32>,
    peaks: Vec<usize>,
}

impl Spectral {
    fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FRAME_SIZE);
        let inverse = planner.plan_fft_inverse(FRAME_SIZE);
        let scratch_len = forward.get_scratch_len().max(inverse.get_scratch_len());

        let window = (0..FRAME_SIZE)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / FRAME_SIZE as f32).cos())
            .collect();

        Self {
            time: forward.make_input_vec(),
            spectrum: forward.make_output_vec(),
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            forward,
            inverse,
            window,
            ana_mag: vec![0.0; BINS],
            ana_phase: vec![0.0; BINS],
            ana_freq: vec![0.0; BINS],
            peaks: Vec::with_capacity(BINS),
        }
    }

    /// Analyse the channel's input FIFO and overlap-add one hop of output
    fn process_frame(&mut self, ch: &mut ChannelState, ratio: f32) {
        let expected = 2.0 * PI * HOP_SIZE as f32 / FRAME_SIZE as f32;
        // Hann² summed over 4x overlap is 1.5; realfft round trips scale by N
        let scale = 1.0 / (FRAME_SIZE as f32 * 1.5);

        for ((t, &x), &w) in self.time.iter_mut().zip(&ch.in_fifo).zip(&self.window) {
            *t = x * w;
        }
        if self
            .forward
            .process_with_scratch(&mut self.time, &mut self.spectrum, &mut self.scratch)
            .is_err()
        {
            ch.out_fifo.fill(0.0);
            return;
        }

        // Analysis: magnitude, phase and true frequency (in bins) per bin
        for k in 0..BINS {
            let c = self.spectrum[k];
            let phase = c.im.atan2(c.re);
            let delta = wrap_phase(phase - ch.last_phase[k] - k as f32 * expected);
            ch.last_phase[k] = phase;

            self.ana_mag[k] = c.norm();
            self.ana_phase[k] = phase;
            self.ana_freq[k] = k as f32 + OVERSAMPLING as f32 * delta / (2.0 * PI);
        }

        self.peaks.clear();
        for k in 1..BINS - 1 {
            let m = self.ana_mag[k];
            if m > PEAK_FLOOR && m > self.ana_mag[k - 1] && m >= self.ana_mag[k + 1] {
                self.peaks.push(k);
            }
        }

        // Shift: each peak carries the bins halfway to its neighbours along.
        // Within a region the phase follows the Hann window's linear phase
        // around the shifted frequency, so the partial stays one coherent lobe.
        self.spectrum.fill(Complex::new(0.0, 0.0));
        ch.next_locked.fill(false);
        for (i, &peak) in self.peaks.iter().enumerate() {
            let lo = if i == 0 {
                0
            } else {
                (self.peaks[i - 1] + peak) / 2 + 1
            };
            let hi = self
                .peaks
                .get(i + 1)
                .map_or(BINS - 1, |&next| (peak + next) / 2);

            let freq = self.ana_freq[peak];
            let target = freq * ratio;
            let key = target.round();
            if key < 0.0 || key > (BINS - 1) as f32 {
                continue;
            }
            let key = key as usize;

            let theta = if ch.locked[key] {
                ch.theta[key] + target * expected
            } else {
                self.ana_phase[peak] + PI * (peak as f32 - freq)
            };
            let theta = wrap_phase(theta);

            let offset = target - freq;
            let first = (lo as f32 + offset).ceil().max(0.0) as usize;
            let last = (hi as f32 + offset).floor().min((BINS - 1) as f32);
            if last < first as f32 {
                continue;
            }
            let last = last as usize;

            // Keep the region's energy through the fractional move
            let energy_in = energy(&self.ana_mag[lo..=hi]);
            let energy_out: f32 = (first..=last)
                .map(|j| interpolate(&self.ana_mag, j as f32 - offset).powi(2))
                .sum();
            if energy_out <= 0.0 {
                continue;
            }
            let gain = (energy_in / energy_out).sqrt();

            for j in first..=last {
                let mag = interpolate(&self.ana_mag, j as f32 - offset) * gain;
                self.spectrum[j] += Complex::from_polar(mag, theta - PI * (j as f32 - target));
                ch.next_theta[j] = theta;
                ch.next_locked[j] = true;
            }
        }
        std::mem::swap(&mut ch.theta, &mut ch.next_theta);
        std::mem::swap(&mut ch.locked, &mut ch.next_locked);

        self.spectrum[0].im = 0.0;
        self.spectrum[BINS - 1].im = 0.0;

        if self
            .inverse
            .process_with_scratch(&mut self.spectrum, &mut self.time, &mut self.scratch)
            .is_err()
        {
            ch.out_fifo.fill(0.0);
            return;
        }

        for ((acc, &y), &w) in ch.accum.iter_mut().zip(&self.time).zip(&self.window) {
            *acc += w * y * scale;
        }

        ch.out_fifo.copy_from_slice(&ch.accum[..HOP_SIZE]);
        ch.accum.copy_within(HOP_SIZE.., 0);
        ch.accum[FRAME_SIZE - HOP_SIZE..].fill(0.0);
        ch.in_fifo.copy_within(HOP_SIZE.., 0);
    }
}

/// Smoothed input/output energy and the correction applied last hop
#[derive(Debug, Clone, Copy)]
struct LevelFollower {
    input: f32,
    output: f32,
    gain: f32,
}

impl LevelFollower {
    fn new() -> Self {
        Self {
            input: 0.0,
            output: 0.0,
            gain: 1.0,
        }
    }

    /// Fold in one hop and return the gains to ramp between across it
    fn update(&mut self, energy_in: f32, energy_out: f32) -> (f32, f32) {
        self.input = LEVEL_SMOOTHING * self.input + (1.0 - LEVEL_SMOOTHING) * energy_in;
        self.output = LEVEL_SMOOTHING * self.output + (1.0 - LEVEL_SMOOTHING) * energy_out;
        let gain = ((self.input + LEVEL_EPSILON) / (self.output + LEVEL_EPSILON))
            .sqrt()
            .clamp(1.0 / MAX_LEVEL_CORRECTION, MAX_LEVEL_CORRECTION);
        let from = self.gain;
        self.gain = gain;
        (from, gain)
    }
}

/// Stereo phase vocoder
///
/// All buffers are allocated in [`PhaseVocoder::new`]; `process` is
/// allocation-free.
pub struct PhaseVocoder {
    channels: [ChannelState; 2],
    spectral: Spectral,
    level: LevelFollower,
    ratio: f32,
    rover: usize,
}

impl PhaseVocoder {
    pub fn new() -> Self {
        Self {
            channels: [ChannelState::new(), ChannelState::new()],
            spectral: Spectral::new(),
            level: LevelFollower::new(),
            ratio: 1.0,
            rover: Self::latency(),
        }
    }

    /// Delay between input and output in frames
    pub const fn latency() -> usize {
        FRAME_SIZE - HOP_SIZE
    }

    pub fn set_semitones(&mut self, semitones: f32) {
        self.ratio = 2f32.powf(semitones / 12.0);
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn reset(&mut self) {
        for ch in &mut self.channels {
            ch.reset();
        }
        self.level = LevelFollower::new();
        self.rover = Self::latency();
    }

    /// Shift `input` into `output`; processes `min(input.len(), output.len())` frames
    pub fn process(&mut self, input: &[StereoSample], output: &mut [StereoSample]) {
        let latency = Self::latency();
        for (inp, out) in input.iter().zip(output.iter_mut()) {
            let [left, right] = &mut self.channels;
            left.in_fifo[self.rover] = inp.left;
            right.in_fifo[self.rover] = inp.right;
            *out = StereoSample::new(
                left.out_fifo[self.rover - latency],
                right.out_fifo[self.rover - latency],
            );

            self.rover += 1;
            if self.rover >= FRAME_SIZE {
                self.rover = latency;
                // The input hop that lines up with the hop about to be output
                let energy_in = energy(&left.in_fifo[HOP_SIZE..2 * HOP_SIZE])
                    + energy(&right.in_fifo[HOP_SIZE..2 * HOP_SIZE]);
                self.spectral.process_frame(left, self.ratio);
                self.spectral.process_frame(right, self.ratio);

                let energy_out = energy(&left.out_fifo) + energy(&right.out_fifo);
                let (from, to) = self.level.update(energy_in, energy_out);
                let step = (to - from) / HOP_SIZE as f32;
                for i in 0..HOP_SIZE {
                    let gain = from + step * (i + 1) as f32;
                    left.out_fifo[i] *= gain;
                    right.out_fifo[i] *= gain;
                }
            }
        }
    }
}

impl Default for PhaseVocoder {
    fn default() -> Self {
        Self::new()
    }
}
