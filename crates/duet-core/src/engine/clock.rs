//! Shared transport clock
//!
//! The clock is the single source of truth for transport state and the
//! canonical playback position. It is shared as `Arc<Clock>` between the
//! control thread, the drift reconciler and both route renderers, and every
//! field is an atomic so no side ever blocks the other.
//!
//! Renderers own their own fractional read cursors. After each callback a
//! renderer publishes a [`CursorSample`] (where its block started, when,
//! and how fast it is advancing) through a per-route seqlock. The canonical
//! position is the minimum frame delivered by the active routes, and the
//! reconciler compares routes by extrapolating each sample to a common
//! instant.
//!
//! Seeks are two-phase: the control side stores a target and bumps a
//! generation counter, each active renderer snaps its cursor when it sees
//! the new generation and acknowledges it, and the last acknowledgement
//! moves the transport out of [`TransportState::Seeking`].

use std::hint::spin_loop;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use crate::types::{RouteId, NUM_ROUTES};

/// Transport state machine
///
/// ```text
/// Stopped --play--> Playing --pause--> Paused --play--> Playing
///    ^                 |                  |
///    +------stop-------+-------stop-------+
/// any --seek--> Seeking --all routes acked--> (state before seek)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Playing = 1,
    Paused = 2,
    Seeking = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Playing,
            2 => TransportState::Paused,
            3 => TransportState::Seeking,
            _ => TransportState::Stopped,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportState::Stopped => "stopped",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
            TransportState::Seeking => "seeking",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One route's published read position
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CursorSample {
    /// Session frame at the start of the published block
    pub start: f64,
    /// Clock time of that block, nanoseconds since the clock epoch
    pub stamp_nanos: u64,
    /// Session frames per second while rendering, 0 when idle
    pub speed: f64,
}

impl CursorSample {
    /// Estimated session frame at `now_nanos`
    ///
    /// Extrapolation is capped at `max_nanos` so a stalled device doesn't
    /// look like it's racing ahead.
    pub fn estimate(&self, now_nanos: u64, max_nanos: u64) -> f64 {
        let elapsed = now_nanos.saturating_sub(self.stamp_nanos).min(max_nanos);
        self.start + self.speed * elapsed as f64 * 1e-9
    }
}

/// Per-route cursor and counters
struct RouteCursor {
    seq: AtomicU32,
    start: AtomicU64,
    stamp: AtomicU64,
    speed: AtomicU64,
    delivered: AtomicU64,
    consumed: AtomicU64,
    rate_trim: AtomicU32,
    ended: AtomicBool,
}

impl RouteCursor {
    fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            start: AtomicU64::new(0f64.to_bits()),
            stamp: AtomicU64::new(0),
            speed: AtomicU64::new(0f64.to_bits()),
            delivered: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            rate_trim: AtomicU32::new(1f32.to_bits()),
            ended: AtomicBool::new(false),
        }
    }

    /// Single writer: the route's renderer
    fn write(&self, sample: CursorSample) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.start.store(sample.start.to_bits(), Ordering::Relaxed);
        self.stamp.store(sample.stamp_nanos, Ordering::Relaxed);
        self.speed.store(sample.speed.to_bits(), Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn read(&self) -> CursorSample {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                spin_loop();
                continue;
            }
            let sample = CursorSample {
                start: f64::from_bits(self.start.load(Ordering::Relaxed)),
                stamp_nanos: self.stamp.load(Ordering::Relaxed),
                speed: f64::from_bits(self.speed.load(Ordering::Relaxed)),
            };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return sample;
            }
        }
    }
}

/// Transport word layout
///
/// Run state, the state to settle into after a seek, the seek generation and
/// the mask of routes still to acknowledge it live in one word, so a seek is
/// published and settled by single atomic updates.
///
/// ```text
/// | generation (48) | settle (4) | state (4) | pending (8) |
/// ```
const PENDING_BITS: u32 = 8;
const PENDING_MASK: u64 = (1 << PENDING_BITS) - 1;
const STATE_SHIFT: u32 = PENDING_BITS;
const SETTLE_SHIFT: u32 = STATE_SHIFT + 4;
const GENERATION_SHIFT: u32 = SETTLE_SHIFT + 4;
const NIBBLE: u64 = 0xF;
const ALL_ROUTES: u8 = (1 << NUM_ROUTES) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transport {
    generation: u64,
    settle: TransportState,
    state: TransportState,
    pending: u8,
}

impl Transport {
    fn unpack(word: u64) -> Self {
        Self {
            generation: word >> GENERATION_SHIFT,
            settle: TransportState::from_u8(((word >> SETTLE_SHIFT) & NIBBLE) as u8),
            state: TransportState::from_u8(((word >> STATE_SHIFT) & NIBBLE) as u8),
            pending: (word & PENDING_MASK) as u8,
        }
    }

    fn pack(self) -> u64 {
        (self.generation << GENERATION_SHIFT)
            | ((self.settle as u64) << SETTLE_SHIFT)
            | ((self.state as u64) << STATE_SHIFT)
            | self.pending as u64
    }
}

/// Shared transport clock
pub struct Clock {
    epoch: Instant,
    transport: AtomicU64,
    seek_target: AtomicU64,
    /// Position reported while no route is rendering
    parked: AtomicU64,
    length: AtomicU64,
    sample_rate: AtomicU32,
    active: AtomicU8,
    ended: AtomicBool,
    cursors: [RouteCursor; NUM_ROUTES],
}

impl Clock {
    pub fn new() -> Self {
        let idle = Transport {
            generation: 0,
            settle: TransportState::Stopped,
            state: TransportState::Stopped,
            pending: 0,
        };
        Self {
            epoch: Instant::now(),
            transport: AtomicU64::new(idle.pack()),
            seek_target: AtomicU64::new(0),
            parked: AtomicU64::new(0),
            length: AtomicU64::new(0),
            sample_rate: AtomicU32::new(crate::types::DEFAULT_SAMPLE_RATE),
            active: AtomicU8::new(0),
            ended: AtomicBool::new(false),
            cursors: [RouteCursor::new(), RouteCursor::new()],
        }
    }

    /// Nanoseconds since the clock was created
    #[inline]
    pub fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────

    /// Rewind for a freshly loaded session and stop
    pub fn reset(&self, length: u64, sample_rate: u32) {
        self.length.store(length, Ordering::Release);
        self.sample_rate.store(sample_rate, Ordering::Release);
        for cursor in &self.cursors {
            cursor.consumed.store(0, Ordering::Relaxed);
            cursor.rate_trim.store(1f32.to_bits(), Ordering::Relaxed);
        }
        self.begin_seek(0, TransportState::Stopped);
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Session sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────

    #[inline]
    fn transport(&self) -> Transport {
        Transport::unpack(self.transport.load(Ordering::Acquire))
    }

    /// Apply `f` to the transport word until it sticks; `None` leaves it be
    fn update_transport(
        &self,
        mut f: impl FnMut(Transport) -> Option<Transport>,
    ) -> Result<Transport, Transport> {
        self.transport
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                f(Transport::unpack(word)).map(Transport::pack)
            })
            .map(Transport::unpack)
            .map_err(Transport::unpack)
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        self.transport().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    /// Whether playback ran off the end of the session
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Start or resume; restarts from 0 after the end was reached
    pub fn play(&self) {
        if self.length() == 0 {
            return;
        }
        if self.is_ended() {
            self.begin_seek(0, TransportState::Playing);
            return;
        }
        let _ = self.update_transport(|mut t| {
            match t.state {
                TransportState::Seeking => t.settle = TransportState::Playing,
                _ => t.state = TransportState::Playing,
            }
            Some(t)
        });
    }

    pub fn pause(&self) {
        let _ = self.update_transport(|mut t| {
            match t.state {
                TransportState::Playing => t.state = TransportState::Paused,
                TransportState::Seeking if t.settle == TransportState::Playing => {
                    t.settle = TransportState::Paused
                }
                _ => return None,
            }
            Some(t)
        });
    }

    /// Halt and rewind to 0
    pub fn stop(&self) {
        self.begin_seek(0, TransportState::Stopped);
    }

    /// Move to `frame`, clamped to the session
    ///
    /// A seek from `Stopped` settles in `Paused` at the target; otherwise the
    /// transport returns to whatever it was doing.
    pub fn seek(&self, frame: u64) {
        let target = self.clamp_frame(frame);
        self.begin_seek_with(target, |t| match t.state {
            TransportState::Playing => TransportState::Playing,
            TransportState::Seeking if t.settle == TransportState::Playing => {
                TransportState::Playing
            }
            _ => TransportState::Paused,
        });
    }

    /// Seek by a signed offset in seconds
    ///
    /// While a seek is still settling the offset applies to its target, so
    /// repeated presses accumulate.
    pub fn seek_relative(&self, seconds: f64) {
        let delta = seconds * self.sample_rate() as f64;
        let target = (self.position() as f64 + delta).max(0.0);
        self.seek(target as u64);
    }

    /// Re-align every route to the canonical position without changing the
    /// transport's run state
    pub fn resync(&self) {
        let position = self.clamp_frame(self.position());
        self.begin_seek_with(position, |t| match t.state {
            TransportState::Seeking => t.settle,
            state => state,
        });
    }

    fn clamp_frame(&self, frame: u64) -> u64 {
        frame.min(self.length().saturating_sub(1))
    }

    fn begin_seek(&self, target: u64, settle: TransportState) {
        self.begin_seek_with(target, |_| settle);
    }

    /// Publish a new seek generation targeting `target`
    ///
    /// The generation, pending mask and run state change in one update: a
    /// late acknowledgement of an older generation can never settle it.
    fn begin_seek_with(&self, target: u64, settle: impl Fn(Transport) -> TransportState) {
        self.ended.store(false, Ordering::Release);
        for cursor in &self.cursors {
            cursor.ended.store(false, Ordering::Release);
        }
        self.seek_target.store(target, Ordering::Release);
        self.parked.store(target, Ordering::Release);

        let active = self.active_mask();
        let _ = self.update_transport(|t| {
            let settle = settle(t);
            Some(Transport {
                generation: t.generation + 1,
                settle,
                state: if active == 0 {
                    settle
                } else {
                    TransportState::Seeking
                },
                pending: active,
            })
        });
    }

    /// Generation of the most recent seek
    #[inline]
    pub fn seek_generation(&self) -> u64 {
        self.transport().generation
    }

    /// Frame the most recent seek targets
    #[inline]
    pub fn seek_target(&self) -> u64 {
        self.seek_target.load(Ordering::Acquire)
    }

    /// Record that `route` has snapped to seek `generation`
    ///
    /// Stale acknowledgements are ignored. Returns whether this settled the
    /// seek.
    pub fn ack_seek(&self, route: RouteId, generation: u64) -> bool {
        let bit = route.bit();
        self.update_transport(|mut t| {
            if t.generation != generation || t.pending & bit == 0 {
                return None;
            }
            t.pending &= !bit;
            if t.pending == 0 && t.state == TransportState::Seeking {
                t.state = t.settle;
            }
            Some(t)
        })
        .map(|previous| previous.pending & !bit == 0)
        .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routes
    // ─────────────────────────────────────────────────────────────────────

    /// Mark a route as rendering (or not)
    ///
    /// A route that goes away mid-seek no longer holds the seek up.
    pub fn set_route_active(&self, route: RouteId, active: bool) {
        if active {
            self.active.fetch_or(route.bit(), Ordering::AcqRel);
            self.cursors[route.index()].ended.store(false, Ordering::Release);
        } else {
            self.parked.store(self.position(), Ordering::Release);
            self.active.fetch_and(!route.bit(), Ordering::AcqRel);
            self.ack_seek(route, self.seek_generation());
            self.cursors[route.index()]
                .speed
                .store(0f64.to_bits(), Ordering::Relaxed);
            self.check_all_ended();
        }
    }

    pub fn is_route_active(&self, route: RouteId) -> bool {
        self.active_mask() & route.bit() != 0
    }

    #[inline]
    pub fn active_mask(&self) -> u8 {
        self.active.load(Ordering::Acquire) & ALL_ROUTES
    }

    /// Publish where a route's latest block started
    pub fn publish(&self, route: RouteId, sample: CursorSample, delivered: u64) {
        let cursor = &self.cursors[route.index()];
        cursor.write(sample);
        cursor.delivered.store(delivered, Ordering::Release);
    }

    pub fn cursor(&self, route: RouteId) -> CursorSample {
        self.cursors[route.index()].read()
    }

    /// Last session frame a route has written to its device
    pub fn delivered(&self, route: RouteId) -> u64 {
        self.cursors[route.index()].delivered.load(Ordering::Acquire)
    }

    /// Account session frames a route has read while playing
    pub fn add_consumed(&self, route: RouteId, frames: u64) {
        self.cursors[route.index()]
            .consumed
            .fetch_add(frames, Ordering::Relaxed);
    }

    /// Session frames a route has read since the session was loaded
    pub fn consumed(&self, route: RouteId) -> u64 {
        self.cursors[route.index()].consumed.load(Ordering::Relaxed)
    }

    /// Read-rate multiplier applied by the route's renderer
    pub fn rate_trim(&self, route: RouteId) -> f32 {
        f32::from_bits(self.cursors[route.index()].rate_trim.load(Ordering::Relaxed))
    }

    pub fn set_rate_trim(&self, route: RouteId, trim: f32) {
        self.cursors[route.index()]
            .rate_trim
            .store(trim.to_bits(), Ordering::Relaxed);
    }

    /// Record that a route read past the end of the session
    ///
    /// Once every active route has ended the transport stops.
    pub fn route_ended(&self, route: RouteId) {
        self.cursors[route.index()].ended.store(true, Ordering::Release);
        self.check_all_ended();
    }

    pub fn is_route_ended(&self, route: RouteId) -> bool {
        self.cursors[route.index()].ended.load(Ordering::Acquire)
    }

    fn check_all_ended(&self) {
        let active = self.active_mask();
        if active == 0 {
            return;
        }
        let all_ended = RouteId::ALL
            .iter()
            .filter(|r| active & r.bit() != 0)
            .all(|r| self.is_route_ended(*r));
        if !all_ended {
            return;
        }
        let stopped = self.update_transport(|mut t| {
            if t.state != TransportState::Playing {
                return None;
            }
            t.state = TransportState::Stopped;
            Some(t)
        });
        if stopped.is_ok() {
            self.parked
                .store(self.length().saturating_sub(1), Ordering::Release);
            self.ended.store(true, Ordering::Release);
        }
    }

    /// Canonical playback position in session frames, within `[0, len)`
    ///
    /// While seeking this is the seek target. Otherwise it is the lowest
    /// frame delivered by any active route, so the reported position never
    /// runs ahead of audio that is actually audible. A session that played
    /// to the end reports its last frame.
    pub fn position(&self) -> u64 {
        if self.state() == TransportState::Seeking {
            return self.seek_target();
        }
        let active = self.active_mask();
        RouteId::ALL
            .iter()
            .filter(|r| active & r.bit() != 0)
            .map(|r| self.delivered(*r))
            .min()
            .unwrap_or_else(|| self.parked.load(Ordering::Acquire))
            .min(self.length().saturating_sub(1))
    }

    /// Position in seconds
    pub fn position_secs(&self) -> f64 {
        self.position() as f64 / self.sample_rate().max(1) as f64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(length: u64) -> Clock {
        let clock = Clock::new();
        clock.reset(length, 44100);
        clock
    }

    #[test]
    fn test_transport_without_routes() {
        let clock = loaded(44100 * 10);
        assert_eq!(clock.state(), TransportState::Stopped);

        clock.play();
        assert_eq!(clock.state(), TransportState::Playing);
        clock.pause();
        assert_eq!(clock.state(), TransportState::Paused);
        clock.stop();
        assert_eq!(clock.state(), TransportState::Stopped);
        assert_eq!(clock.position(), 0);
    }

    #[test]
    fn test_play_without_session_is_ignored() {
        let clock = Clock::new();
        clock.play();
        assert_eq!(clock.state(), TransportState::Stopped);
    }

    #[test]
    fn test_seek_clamps_to_session() {
        let clock = loaded(1000);
        clock.seek(5000);
        assert_eq!(clock.position(), 999);
        assert_eq!(clock.state(), TransportState::Paused);

        clock.seek_relative(-100.0);
        assert_eq!(clock.position(), 0);
    }

    #[test]
    fn test_seek_waits_for_every_active_route() {
        let clock = loaded(441_000);
        clock.set_route_active(RouteId::A, true);
        clock.set_route_active(RouteId::B, true);
        clock.play();

        clock.seek(44_100);
        let generation = clock.seek_generation();
        assert_eq!(clock.state(), TransportState::Seeking);
        assert_eq!(clock.position(), 44_100);

        // Stale acknowledgement changes nothing
        assert!(!clock.ack_seek(RouteId::A, generation - 1));
        assert!(!clock.ack_seek(RouteId::A, generation));
        assert_eq!(clock.state(), TransportState::Seeking);
        assert!(clock.ack_seek(RouteId::B, generation));
        assert_eq!(clock.state(), TransportState::Playing);
    }

    #[test]
    fn test_pause_during_seek_settles_paused() {
        let clock = loaded(441_000);
        clock.set_route_active(RouteId::A, true);
        clock.play();
        clock.seek(1000);
        clock.pause();
        assert!(clock.ack_seek(RouteId::A, clock.seek_generation()));
        assert_eq!(clock.state(), TransportState::Paused);
    }

    #[test]
    fn test_route_leaving_releases_seek() {
        let clock = loaded(441_000);
        clock.set_route_active(RouteId::A, true);
        clock.set_route_active(RouteId::B, true);
        clock.play();
        clock.seek(10);
        clock.ack_seek(RouteId::A, clock.seek_generation());
        clock.set_route_active(RouteId::B, false);
        assert_eq!(clock.state(), TransportState::Playing);
    }

    #[test]
    fn test_position_is_slowest_active_route() {
        let clock = loaded(441_000);
        clock.set_route_active(RouteId::A, true);
        clock.set_route_active(RouteId::B, true);
        clock.play();
        let generation = clock.seek_generation();
        clock.ack_seek(RouteId::A, generation);
        clock.ack_seek(RouteId::B, generation);

        clock.publish(RouteId::A, CursorSample::default(), 2048);
        clock.publish(RouteId::B, CursorSample::default(), 1024);
        assert_eq!(clock.position(), 1024);

        clock.set_route_active(RouteId::B, false);
        assert_eq!(clock.position(), 2048);
    }

    #[test]
    fn test_end_of_session_stops_and_replay_rewinds() {
        let clock = loaded(1000);
        clock.set_route_active(RouteId::A, true);
        clock.play();
        clock.ack_seek(RouteId::A, clock.seek_generation());
        clock.publish(RouteId::A, CursorSample::default(), 1000);
        clock.route_ended(RouteId::A);

        assert_eq!(clock.state(), TransportState::Stopped);
        assert!(clock.is_ended());
        assert_eq!(clock.position(), 999);

        clock.play();
        assert_eq!(clock.state(), TransportState::Seeking);
        assert_eq!(clock.position(), 0);
        assert!(clock.ack_seek(RouteId::A, clock.seek_generation()));
        assert_eq!(clock.state(), TransportState::Playing);
    }

    #[test]
    fn test_seek_is_visible_while_renderers_ack() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let clock = loaded(44_100 * 600);
        clock.set_route_active(RouteId::A, true);
        clock.set_route_active(RouteId::B, true);
        clock.play();
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            for route in RouteId::ALL {
                let clock = &clock;
                let done = &done;
                scope.spawn(move || {
                    let mut seen = u64::MAX;
                    while !done.load(Ordering::Acquire) {
                        let generation = clock.seek_generation();
                        if generation != seen {
                            seen = generation;
                            let target = clock.seek_target();
                            clock.publish(route, CursorSample::default(), target);
                            clock.ack_seek(route, generation);
                        }
                        spin_loop();
                    }
                });
            }

            let mut misses = 0;
            for i in 0..200_000u64 {
                let target = (i * 7919) % clock.length();
                clock.seek(target);
                if clock.position() != target {
                    misses += 1;
                }
            }
            done.store(true, Ordering::Release);
            assert_eq!(misses, 0);
        });
    }

    #[test]
    fn test_relative_seeks_accumulate_on_pending_target() {
        let clock = loaded(44_100 * 60);
        clock.set_route_active(RouteId::A, true);
        clock.play();
        clock.ack_seek(RouteId::A, clock.seek_generation());

        clock.seek(44_100 * 10);
        clock.seek_relative(5.0);
        clock.seek_relative(5.0);
        assert_eq!(clock.state(), TransportState::Seeking);
        assert_eq!(clock.position(), 44_100 * 20);

        assert!(clock.ack_seek(RouteId::A, clock.seek_generation()));
        assert_eq!(clock.state(), TransportState::Playing);
    }

    #[test]
    fn test_old_generation_ack_cannot_settle_new_seek() {
        let clock = loaded(441_000);
        clock.set_route_active(RouteId::A, true);
        clock.play();
        let first = clock.seek_generation();
        clock.seek(1000);
        assert!(!clock.ack_seek(RouteId::A, first));
        assert_eq!(clock.state(), TransportState::Seeking);
        assert_eq!(clock.position(), 1000);
    }

    #[test]
    fn test_cursor_estimate_is_capped() {
        let sample = CursorSample {
            start: 1000.0,
            stamp_nanos: 1_000_000_000,
            speed: 44100.0,
        };
        let estimate = sample.estimate(1_500_000_000, 100_000_000);
        assert!((estimate - (1000.0 + 4410.0)).abs() < 1e-6);
        // Before the stamp: no negative extrapolation
        assert_eq!(sample.estimate(0, 100_000_000), 1000.0);
    }

    #[test]
    fn test_cursor_round_trip() {
        let clock = loaded(1000);
        let sample = CursorSample {
            start: 12.5,
            stamp_nanos: 99,
            speed: 48000.0,
        };
        clock.publish(RouteId::B, sample, 12);
        assert_eq!(clock.cursor(RouteId::B), sample);
        assert_eq!(clock.delivered(RouteId::B), 12);
    }
}
