//! Route renderer: the real-time half of one output route
//!
//! A [`RouteRenderer`] lives inside a device callback (or a simulated one)
//! and produces that device's interleaved output. Per callback it:
//!
//! 1. Drains session swaps from its lock-free command queue
//! 2. Follows seeks published by the [`Clock`]
//! 3. Reads both stems at its own cursor, resampling on the fly when the
//!    device rate differs from the session rate
//! 4. Pitch-shifts each active stem, mixes, limits
//! 5. Publishes its cursor back to the clock
//!
//! Nothing here allocates, locks or blocks. Mix settings arrive as
//! immutable snapshots through a `basedrop::SharedCell`; outgoing sessions
//! and snapshots are reclaimed by the collector thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::{Shared, SharedCell};

use super::clock::{Clock, CursorSample, TransportState};
use super::mix_bus::{mix_into, MixStats};
use super::route::RouteSnapshot;
use crate::audio::MAX_BLOCK_SIZE;
use crate::loader::SessionAudio;
use crate::pitch::{PitchAlgorithm, PitchShifter};
use crate::types::{RouteId, StemRole, StereoSample, NUM_STEMS};

/// Commands from the control thread to a renderer
pub enum RendererCommand {
    /// Start reading a new session from frame 0
    LoadSession(Shared<SessionAudio>),
    /// Drop the current session and output silence
    UnloadSession,
}

/// Capacity of a renderer's command queue
///
/// Session swaps are rare; a handful of slots is plenty.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Create a renderer command channel
pub fn command_channel() -> (rtrb::Producer<RendererCommand>, rtrb::Consumer<RendererCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

/// Lock-free status shared between a renderer and the control thread
pub struct RouteMonitor {
    peak_left: AtomicU32,
    peak_right: AtomicU32,
    clipped: AtomicU64,
    callbacks: AtomicU64,
    disconnected: AtomicBool,
    shutdown: AtomicBool,
    halted: AtomicBool,
}

impl RouteMonitor {
    pub fn new() -> Self {
        Self {
            peak_left: AtomicU32::new(0f32.to_bits()),
            peak_right: AtomicU32::new(0f32.to_bits()),
            clipped: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    /// Peak output level of the last callback, per channel
    pub fn levels(&self) -> [f32; 2] {
        [
            f32::from_bits(self.peak_left.load(Ordering::Relaxed)),
            f32::from_bits(self.peak_right.load(Ordering::Relaxed)),
        ]
    }

    /// Samples clamped by the limiter since the route was bound
    pub fn clipped_samples(&self) -> u64 {
        self.clipped.load(Ordering::Relaxed)
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    /// Flag the device as gone; called from the stream's error callback
    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Ask the renderer to go silent for good
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Whether the renderer has observed the shutdown request
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn record(&self, stats: &MixStats) {
        self.peak_left
            .store(stats.peak_left.to_bits(), Ordering::Relaxed);
        self.peak_right
            .store(stats.peak_right.to_bits(), Ordering::Relaxed);
        if stats.clipped > 0 {
            self.clipped
                .fetch_add(stats.clipped as u64, Ordering::Relaxed);
        }
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RouteMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a renderer needs from the engine
pub struct RendererContext {
    pub route: RouteId,
    pub clock: Arc<Clock>,
    pub snapshot: Arc<SharedCell<RouteSnapshot>>,
    pub monitor: Arc<RouteMonitor>,
    pub commands: rtrb::Consumer<RendererCommand>,
    pub session: Option<Shared<SessionAudio>>,
    pub pitch_algorithm: PitchAlgorithm,
}

/// Per-route real-time renderer
pub struct RouteRenderer {
    route: RouteId,
    clock: Arc<Clock>,
    snapshot: Arc<SharedCell<RouteSnapshot>>,
    monitor: Arc<RouteMonitor>,
    commands: rtrb::Consumer<RendererCommand>,
    session: Option<Shared<SessionAudio>>,
    device_rate: u32,
    channels: usize,
    /// Fractional read position in session frames
    cursor: f64,
    /// Sub-frame remainder not yet added to the consumed counter
    consumed_remainder: f64,
    seen_generation: u64,
    ended: bool,
    shifters: [PitchShifter; NUM_STEMS],
    stem_active: [bool; NUM_STEMS],
    stem_in: [Vec<StereoSample>; NUM_STEMS],
    stem_out: [Vec<StereoSample>; NUM_STEMS],
    mix: Vec<StereoSample>,
}

impl RouteRenderer {
    /// Create a renderer for a device running at `device_rate` with
    /// `channels` interleaved output channels
    pub fn new(ctx: RendererContext, device_rate: u32, channels: u16) -> Self {
        let seen_generation = ctx.clock.seek_generation();
        let shifter = || PitchShifter::new(ctx.pitch_algorithm, device_rate);
        let block = || vec![StereoSample::silence(); MAX_BLOCK_SIZE];

        Self {
            shifters: [shifter(), shifter()],
            route: ctx.route,
            clock: ctx.clock,
            snapshot: ctx.snapshot,
            monitor: ctx.monitor,
            commands: ctx.commands,
            session: ctx.session,
            device_rate: device_rate.max(1),
            channels: channels.max(1) as usize,
            cursor: 0.0,
            consumed_remainder: 0.0,
            seen_generation,
            ended: false,
            stem_active: [false; NUM_STEMS],
            stem_in: [block(), block()],
            stem_out: [block(), block()],
            mix: block(),
        }
    }

    pub fn route(&self) -> RouteId {
        self.route
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn monitor(&self) -> &Arc<RouteMonitor> {
        &self.monitor
    }

    /// Current fractional read position in session frames
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Fill one device buffer
    ///
    /// `output` is interleaved with [`Self::channels`] channels.
    /// `now_nanos` is the clock time the buffer is rendered for.
    pub fn render(&mut self, output: &mut [f32], now_nanos: u64) {
        if self.monitor.is_shutdown() {
            output.fill(0.0);
            self.monitor.halted.store(true, Ordering::Release);
            return;
        }

        self.process_commands();
        self.follow_seek(now_nanos);

        let channels = self.channels;
        let frames = output.len() / channels;
        let start = self.cursor;
        let step = self.step();
        let playing = self.clock.state() == TransportState::Playing
            && self.clock.is_route_active(self.route)
            && !self.monitor.is_disconnected()
            && !self.ended
            && self.session.is_some();

        let mut stats = MixStats::default();
        output.fill(0.0);

        if playing {
            let snapshot = self.snapshot.get();
            for shifter in &mut self.shifters {
                shifter.set_semitones(snapshot.pitch_semitones);
            }

            let mut offset = 0;
            while offset < frames {
                let n = (frames - offset).min(MAX_BLOCK_SIZE);
                let chunk = self.render_chunk(&snapshot, step, n);
                stats.peak_left = stats.peak_left.max(chunk.peak_left);
                stats.peak_right = stats.peak_right.max(chunk.peak_right);
                stats.clipped += chunk.clipped;

                let out = &mut output[offset * channels..(offset + n) * channels];
                write_interleaved(&self.mix[..n], out, channels);
                offset += n;
            }

            self.account_consumed(self.cursor - start);
        }

        let length = self.session_len();
        let speed = if playing {
            step * self.device_rate as f64
        } else {
            0.0
        };
        self.clock.publish(
            self.route,
            CursorSample {
                start,
                stamp_nanos: now_nanos,
                speed,
            },
            (self.cursor as u64).min(length as u64),
        );
        self.monitor.record(&stats);

        if playing && self.cursor >= length as f64 {
            self.ended = true;
            self.clock.route_ended(self.route);
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                RendererCommand::LoadSession(session) => {
                    self.session = Some(session);
                    self.cursor = 0.0;
                }
                RendererCommand::UnloadSession => {
                    self.session = None;
                    self.cursor = 0.0;
                }
            }
            self.ended = false;
            self.reset_shifters();
        }
    }

    fn follow_seek(&mut self, now_nanos: u64) {
        let generation = self.clock.seek_generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;
        let target = self.clock.seek_target();
        self.cursor = target as f64;
        self.ended = false;
        self.reset_shifters();
        // Publish the snapped cursor before acking so a settled seek never
        // reports the pre-seek position
        self.clock.publish(
            self.route,
            CursorSample {
                start: self.cursor,
                stamp_nanos: now_nanos,
                speed: 0.0,
            },
            target,
        );
        self.clock.ack_seek(self.route, generation);
    }

    fn reset_shifters(&mut self) {
        for shifter in &mut self.shifters {
            shifter.reset();
        }
    }

    /// Session frames advanced per device frame
    fn step(&self) -> f64 {
        let session_rate = self
            .session
            .as_ref()
            .map(|s| s.sample_rate)
            .unwrap_or(self.device_rate);
        let trim = self.clock.rate_trim(self.route) as f64;
        session_rate as f64 / self.device_rate as f64 * trim
    }

    fn session_len(&self) -> usize {
        self.session.as_ref().map(|s| s.len()).unwrap_or(0)
    }

    fn account_consumed(&mut self, advanced: f64) {
        self.consumed_remainder += advanced;
        let whole = self.consumed_remainder.floor();
        if whole >= 1.0 {
            self.clock.add_consumed(self.route, whole as u64);
            self.consumed_remainder -= whole;
        }
    }

    /// Render `n` frames into `self.mix` and advance the cursor
    fn render_chunk(&mut self, snapshot: &RouteSnapshot, step: f64, n: usize) -> MixStats {
        let Some(session) = self.session.as_ref() else {
            self.mix[..n].fill(StereoSample::silence());
            return MixStats::default();
        };
        let length = session.len();

        for role in StemRole::ALL {
            let i = role.index();
            if !snapshot.is_active(role) {
                self.stem_active[i] = false;
                continue;
            }
            if !self.stem_active[i] {
                self.shifters[i].reset();
                self.stem_active[i] = true;
            }
            read_stem(
                &session.stems[i].samples[..length],
                self.cursor,
                step,
                &mut self.stem_in[i][..n],
            );
            self.shifters[i].process(&self.stem_in[i][..n], &mut self.stem_out[i][..n]);
        }

        let inputs = [
            (&self.stem_out[0][..n], snapshot.gains[0]),
            (&self.stem_out[1][..n], snapshot.gains[1]),
        ];
        let stats = mix_into(&inputs, &mut self.mix[..n]);

        self.cursor = (self.cursor + n as f64 * step).min(length as f64);
        stats
    }
}

/// Read `out.len()` frames starting at `cursor`, `step` frames apart
///
/// Linear interpolation between neighbours; reads past the end yield
/// silence. Integral positions are copied exactly.
fn read_stem(samples: &[StereoSample], cursor: f64, step: f64, out: &mut [StereoSample]) {
    for (i, o) in out.iter_mut().enumerate() {
        let pos = cursor + i as f64 * step;
        let idx = pos as usize;
        let Some(&a) = samples.get(idx) else {
            *o = StereoSample::silence();
            continue;
        };
        let frac = (pos - idx as f64) as f32;
        *o = if frac == 0.0 {
            a
        } else {
            let b = samples.get(idx + 1).copied().unwrap_or_default();
            a.lerp(b, frac)
        };
    }
}

/// Write stereo frames to an interleaved device buffer
///
/// Mono devices get the average of both sides; channels beyond the first
/// two are left silent.
fn write_interleaved(frames: &[StereoSample], out: &mut [f32], channels: usize) {
    match channels {
        1 => {
            for (o, s) in out.iter_mut().zip(frames) {
                *o = 0.5 * (s.left + s.right);
            }
        }
        _ => {
            for (o, s) in out.chunks_exact_mut(channels).zip(frames) {
                o[0] = s.left;
                o[1] = s.right;
                o[2..].fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gc::gc_handle;

    struct Harness {
        clock: Arc<Clock>,
        snapshot: Arc<SharedCell<RouteSnapshot>>,
        monitor: Arc<RouteMonitor>,
        commands: rtrb::Producer<RendererCommand>,
        renderer: RouteRenderer,
    }

    fn session(frames: usize) -> Shared<SessionAudio> {
        let instr = (0..frames).map(|i| StereoSample::mono(i as f32 * 1e-5)).collect();
        let vocal = vec![StereoSample::new(0.25, -0.25); frames];
        Shared::new(&gc_handle(), SessionAudio::from_stems(44100, instr, vocal))
    }

    fn harness(route: RouteId, device_rate: u32, channels: u16, frames: usize) -> Harness {
        let clock = Arc::new(Clock::new());
        let snapshot = Arc::new(SharedCell::new(Shared::new(
            &gc_handle(),
            RouteSnapshot::default(),
        )));
        let monitor = Arc::new(RouteMonitor::new());
        let (commands, consumer) = command_channel();

        let renderer = RouteRenderer::new(
            RendererContext {
                route,
                clock: Arc::clone(&clock),
                snapshot: Arc::clone(&snapshot),
                monitor: Arc::clone(&monitor),
                commands: consumer,
                session: Some(session(frames)),
                pitch_algorithm: PitchAlgorithm::PhaseVocoder,
            },
            device_rate,
            channels,
        );
        clock.reset(frames as u64, 44100);
        clock.set_route_active(route, true);

        Harness {
            clock,
            snapshot,
            monitor,
            commands,
            renderer,
        }
    }

    fn set_gains(h: &Harness, gains: [f32; NUM_STEMS]) {
        h.snapshot.set(Shared::new(
            &gc_handle(),
            RouteSnapshot {
                gains,
                ..RouteSnapshot::default()
            },
        ));
    }

    #[test]
    fn test_stopped_renderer_outputs_silence() {
        let mut h = harness(RouteId::A, 44100, 2, 10_000);
        let mut out = vec![1.0f32; 512];
        h.renderer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(h.clock.consumed(RouteId::A), 0);
    }

    #[test]
    fn test_unity_mix_at_session_rate() {
        let mut h = harness(RouteId::A, 44100, 2, 10_000);
        set_gains(&h, [1.0, 0.0]);
        h.clock.play();

        let mut out = vec![0.0f32; 256 * 2];
        h.renderer.render(&mut out, 0);
        h.renderer.render(&mut out, 5_000_000);

        // Second block starts at frame 256 of the instrumental ramp
        assert_eq!(out[0], 256.0 * 1e-5);
        assert_eq!(out[1], 256.0 * 1e-5);
        assert_eq!(h.clock.state(), TransportState::Playing);
        assert_eq!(h.clock.consumed(RouteId::A), 512);
        assert_eq!(h.clock.delivered(RouteId::A), 512);
        assert_eq!(h.clock.cursor(RouteId::A).speed, 44100.0);
    }

    #[test]
    fn test_muted_stem_is_absent() {
        let mut h = harness(RouteId::B, 44100, 2, 10_000);
        set_gains(&h, [0.0, 1.0]);
        h.clock.play();
        let mut out = vec![0.0f32; 64];
        h.renderer.render(&mut out, 0);
        assert_eq!(&out[..4], &[0.25, -0.25, 0.25, -0.25]);

        set_gains(&h, [1.0, 0.0]);
        h.renderer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s >= 0.0 && s < 0.01));
    }

    #[test]
    fn test_channel_layouts() {
        let mut mono = harness(RouteId::A, 44100, 1, 1000);
        set_gains(&mono, [0.0, 1.0]);
        mono.clock.play();
        let mut out = vec![1.0f32; 16];
        mono.renderer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0));

        let mut quad = harness(RouteId::A, 44100, 4, 1000);
        set_gains(&quad, [0.0, 1.0]);
        quad.clock.play();
        let mut out = vec![1.0f32; 16];
        quad.renderer.render(&mut out, 0);
        assert_eq!(&out[..8], &[0.25, -0.25, 0.0, 0.0, 0.25, -0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_device_rate_conversion() {
        let mut h = harness(RouteId::A, 48000, 2, 100_000);
        h.clock.play();
        let mut out = vec![0.0f32; 480 * 2];
        h.renderer.render(&mut out, 0);

        let expected = 480.0 * 44100.0 / 48000.0;
        assert!((h.renderer.cursor() - expected).abs() < 1e-9);
        assert!((h.clock.cursor(RouteId::A).speed - 44100.0).abs() < 1e-6);
    }

    #[test]
    fn test_seek_is_followed_and_acknowledged() {
        let mut h = harness(RouteId::A, 44100, 2, 100_000);
        set_gains(&h, [1.0, 0.0]);
        h.clock.play();
        let mut out = vec![0.0f32; 128];
        h.renderer.render(&mut out, 0);

        h.clock.seek(50_000);
        assert_eq!(h.clock.state(), TransportState::Seeking);
        h.renderer.render(&mut out, 1_000_000);

        assert_eq!(h.clock.state(), TransportState::Playing);
        assert_eq!(out[0], 50_000.0 * 1e-5);
        assert_eq!(h.clock.delivered(RouteId::A), 50_064);
    }

    #[test]
    fn test_end_of_session_stops_transport() {
        let mut h = harness(RouteId::A, 44100, 2, 300);
        h.clock.play();
        let mut out = vec![0.0f32; 256 * 2];
        h.renderer.render(&mut out, 0);
        assert_eq!(h.clock.state(), TransportState::Playing);
        h.renderer.render(&mut out, 1_000_000);

        assert_eq!(h.clock.state(), TransportState::Stopped);
        assert!(h.clock.is_ended());
        assert_eq!(h.clock.position(), 299);
        // Past the end: silence
        assert!(out[2 * 44..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_session_swap_and_unload() {
        let mut h = harness(RouteId::A, 44100, 2, 1000);
        set_gains(&h, [0.0, 1.0]);
        h.clock.play();

        assert!(h
            .commands
            .push(RendererCommand::UnloadSession)
            .is_ok());
        let mut out = vec![1.0f32; 64];
        h.renderer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0));

        assert!(h
            .commands
            .push(RendererCommand::LoadSession(session(1000)))
            .is_ok());
        h.renderer.render(&mut out, 0);
        assert_eq!(out[0], 0.25);
    }

    #[test]
    fn test_shutdown_halts_renderer() {
        let mut h = harness(RouteId::A, 44100, 2, 1000);
        h.clock.play();
        h.monitor.request_shutdown();
        let mut out = vec![1.0f32; 64];
        h.renderer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(h.monitor.is_halted());
    }

    #[test]
    fn test_read_stem_interpolates() {
        let samples = vec![StereoSample::mono(0.0), StereoSample::mono(1.0)];
        let mut out = [StereoSample::mono(9.0); 5];
        read_stem(&samples, 0.0, 0.5, &mut out);
        assert_eq!(out[0].left, 0.0);
        assert_eq!(out[1].left, 0.5);
        assert_eq!(out[2].left, 1.0);
        // Last frame fades toward silence, then nothing
        assert_eq!(out[3].left, 0.5);
        assert_eq!(out[4], StereoSample::silence());
    }
}
