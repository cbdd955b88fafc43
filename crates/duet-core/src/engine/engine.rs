//! Playback engine: the control-thread side of a session
//!
//! [`PlaybackEngine`] owns the loaded stems, the shared [`Clock`], both
//! routes' configuration and outputs, and the drift reconciler. Every
//! public operation runs on the caller's (non-real-time) thread and reaches
//! the renderers only through lock-free handoffs:
//!
//! - session swaps go through each route's rtrb command queue
//! - mix changes are published as immutable [`RouteSnapshot`]s
//! - transport commands are atomic stores on the clock
//!
//! Faults raised inside render callbacks (device gone, drift not converging)
//! are collected by [`PlaybackEngine::poll_faults`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use basedrop::{Shared, SharedCell};

use super::clock::{Clock, CursorSample, TransportState};
use super::gc::gc_handle;
use super::renderer::{
    command_channel, RendererCommand, RendererContext, RouteMonitor, RouteRenderer,
};
use super::route::{RouteConfig, RouteSnapshot};
use super::sim::{SimulatedDevice, SimulatedOutput};
use super::sync::{DriftReconciler, SyncMonitor, SyncReport, SyncThread};
use crate::audio::{
    default_device, find_device, plan_stream, start_stream, DeviceBinding, DeviceError, DeviceId,
    RouteStream,
};
use crate::codec::{CodecService, FileCodec};
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, EngineResult, SyncFault};
use crate::loader::{load_session, LoadOptions, LoadProgress, SessionAudio};
use crate::types::{RouteId, StemRole, NUM_ROUTES, NUM_STEMS};

/// Longest teardown waits for renderers to acknowledge shutdown
const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Summary of one loaded stem
#[derive(Debug, Clone, PartialEq)]
pub struct StemInfo {
    pub role: StemRole,
    pub path: PathBuf,
    pub lufs: Option<f32>,
    pub source_sample_rate: u32,
    pub source_channels: u16,
}

/// Summary of a loaded session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub sample_rate: u32,
    pub frames: u64,
    pub duration_secs: f64,
    pub stems: [StemInfo; NUM_STEMS],
}

impl SessionInfo {
    fn from_audio(session: &SessionAudio) -> Self {
        let stem = |role: StemRole| {
            let s = session.stem(role);
            StemInfo {
                role,
                path: s.path.clone(),
                lufs: s.lufs,
                source_sample_rate: s.source_sample_rate,
                source_channels: s.source_channels,
            }
        };
        Self {
            sample_rate: session.sample_rate,
            frames: session.len() as u64,
            duration_secs: session.duration_secs(),
            stems: [stem(StemRole::Instrumental), stem(StemRole::Vocal)],
        }
    }
}

/// Per-route part of [`EngineStatus`]
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStatus {
    pub route: RouteId,
    /// Negotiated output, `None` when unbound
    pub binding: Option<DeviceBinding>,
    pub simulated: bool,
    /// Bound to the same device as route A and therefore not opened
    pub shared_device: bool,
    pub disconnected: bool,
    /// Peak output level of the last callback (left, right)
    pub levels: [f32; 2],
    pub clipped_samples: u64,
    /// Session frames read since the session was loaded
    pub consumed_frames: u64,
    /// Currently slowed down by the drift reconciler
    pub nudged: bool,
    /// Loudness trim applied per stem (instrumental, vocal)
    pub trims_db: [f32; NUM_STEMS],
}

/// Snapshot of everything a control surface displays
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: TransportState,
    pub is_playing: bool,
    /// Playback ran off the end of the session
    pub ended: bool,
    pub position_frames: u64,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub routes: [RouteStatus; NUM_ROUTES],
    /// Route A minus route B, when both are playing
    pub drift_ms: Option<f32>,
    pub sync_warning: Option<SyncFault>,
    pub resyncs: u64,
}

enum OutputKind {
    Device(RouteStream),
    Simulated,
}

/// A route's live connection to its renderer
struct BoundOutput {
    kind: OutputKind,
    binding: DeviceBinding,
    commands: rtrb::Producer<RendererCommand>,
    monitor: Arc<RouteMonitor>,
    disconnect_reported: bool,
}

struct RouteSlot {
    config: RouteConfig,
    snapshot: Arc<SharedCell<RouteSnapshot>>,
    output: Option<BoundOutput>,
    shared_device: bool,
}

/// Dual-output synchronized stem player
pub struct PlaybackEngine {
    config: EngineConfig,
    codec: Arc<dyn CodecService>,
    clock: Arc<Clock>,
    routes: [RouteSlot; NUM_ROUTES],
    session: Option<Shared<SessionAudio>>,
    sync_monitor: Arc<SyncMonitor>,
    reconciler: Arc<Mutex<DriftReconciler>>,
    sync_thread: Option<SyncThread>,
}

impl PlaybackEngine {
    /// Create an engine decoding through `codec`
    ///
    /// No device is opened until a route is bound.
    pub fn new(config: EngineConfig, codec: Arc<dyn CodecService>) -> Self {
        let clock = Arc::new(Clock::new());
        let sync_monitor = Arc::new(SyncMonitor::new());
        let reconciler = DriftReconciler::new(
            Arc::clone(&clock),
            Arc::clone(&sync_monitor),
            config.sync.clone(),
        );

        let routes = RouteId::ALL.map(|route| {
            let route_config = match config.route(route).validated() {
                Ok(valid) => valid,
                Err(e) => {
                    log::warn!("Ignoring invalid {} route config: {}", route, e);
                    RouteConfig::default_for(route)
                }
            };
            let snapshot =
                RouteSnapshot::resolve(&route_config, [None; NUM_STEMS], &config.loudness);
            RouteSlot {
                config: route_config,
                snapshot: Arc::new(SharedCell::new(Shared::new(&gc_handle(), snapshot))),
                output: None,
                shared_device: false,
            }
        });

        // Both routes share one pitch; route A's wins at startup
        let mut engine = Self {
            config,
            codec,
            clock,
            routes,
            session: None,
            sync_monitor,
            reconciler: Arc::new(Mutex::new(reconciler)),
            sync_thread: None,
        };
        let pitch = engine.routes[RouteId::A.index()].config.pitch_semitones;
        engine.routes[RouteId::B.index()].config.pitch_semitones = pitch;
        engine.refresh_snapshots();
        engine
    }

    /// Create an engine using the built-in file codec
    pub fn with_file_codec(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(FileCodec::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session
    // ─────────────────────────────────────────────────────────────────────

    /// Load a stem pair, replacing the current session
    ///
    /// Playback stops first. On failure the previous session stays loaded.
    pub fn load_session(&mut self, instrumental: &Path, vocal: &Path) -> EngineResult<SessionInfo> {
        self.load_session_with_progress(instrumental, vocal, |_| {})
    }

    /// [`Self::load_session`] with progress reporting
    pub fn load_session_with_progress(
        &mut self,
        instrumental: &Path,
        vocal: &Path,
        mut progress: impl FnMut(LoadProgress),
    ) -> EngineResult<SessionInfo> {
        log::info!("Loading session: {:?} + {:?}", instrumental, vocal);
        let options = LoadOptions {
            reference_sample_rate: self.config.reference_sample_rate,
        };
        let audio = load_session(
            self.codec.as_ref(),
            instrumental,
            vocal,
            &options,
            &mut progress,
        )?;
        let info = SessionInfo::from_audio(&audio);

        self.clock.stop();
        let session = Shared::new(&gc_handle(), audio);
        for route in RouteId::ALL {
            self.send_command(route, RendererCommand::LoadSession(Shared::clone(&session)));
        }
        self.session = Some(session);
        self.clock.reset(info.frames, info.sample_rate);
        if let Ok(mut reconciler) = self.reconciler.lock() {
            reconciler.reset();
        }
        self.refresh_snapshots();

        log::info!(
            "Session ready: {:.1}s at {}Hz",
            info.duration_secs,
            info.sample_rate
        );
        Ok(info)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session.as_deref().map(SessionInfo::from_audio)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Routes
    // ─────────────────────────────────────────────────────────────────────

    pub fn route_config(&self, route: RouteId) -> &RouteConfig {
        &self.routes[route.index()].config
    }

    /// Replace a route's mix settings
    ///
    /// Takes effect at the start of the renderer's next callback. The pitch
    /// is applied to both routes. A changed device rebinds the route if it
    /// is currently bound to hardware.
    pub fn configure_route(&mut self, route: RouteId, config: RouteConfig) -> EngineResult<()> {
        let config = config.validated()?;
        let device_changed = config.device != self.routes[route.index()].config.device;
        let pitch = config.pitch_semitones;

        self.routes[route.index()].config = config;
        self.routes[route.other().index()].config.pitch_semitones = pitch;
        self.refresh_snapshots();

        let on_hardware = matches!(
            self.routes[route.index()].output,
            Some(BoundOutput {
                kind: OutputKind::Device(_),
                ..
            })
        );
        if device_changed && on_hardware {
            let device = self.routes[route.index()].config.device.clone();
            self.bind_route(route, device)?;
        }
        Ok(())
    }

    /// Set the shared transposition of both routes
    pub fn set_pitch(&mut self, semitones: f32) -> EngineResult<()> {
        let mut config = self.route_config(RouteId::A).clone();
        config.pitch_semitones = semitones;
        self.configure_route(RouteId::A, config)
    }

    fn refresh_snapshots(&self) {
        let lufs = self
            .session
            .as_deref()
            .map(SessionAudio::lufs)
            .unwrap_or([None; NUM_STEMS]);
        for slot in &self.routes {
            let snapshot = RouteSnapshot::resolve(&slot.config, lufs, &self.config.loudness);
            slot.snapshot.set(Shared::new(&gc_handle(), snapshot));
        }
    }

    /// Bind a route to an output device (`None` = system default)
    ///
    /// Any previous output of the route is closed first. Binding to the
    /// device route A already uses leaves route B unopened and flagged as
    /// `shared_device`.
    pub fn bind_route(
        &mut self,
        route: RouteId,
        device: Option<DeviceId>,
    ) -> EngineResult<DeviceBinding> {
        self.unbind_route(route);

        let (cpal_device, id) = match &device {
            Some(id) => (find_device(id)?, id.clone()),
            None => default_device()?,
        };
        self.routes[route.index()].config.device = device;
        if let Some(binding) = self.claim_device(route, &id) {
            return Ok(binding);
        }

        let plan = plan_stream(
            &cpal_device,
            &id,
            self.preferred_rate(),
            self.config.buffer_size,
        )?;
        let (renderer, commands, monitor) =
            self.build_renderer(route, plan.binding.sample_rate, plan.binding.channels);
        let stream = start_stream(&cpal_device, &plan, renderer, Arc::clone(&self.clock))?;

        self.attach(
            route,
            BoundOutput {
                kind: OutputKind::Device(stream),
                binding: plan.binding.clone(),
                commands,
                monitor,
                disconnect_reported: false,
            },
        );
        self.ensure_sync_thread()?;
        Ok(plan.binding)
    }

    /// Resolve a bind of `route` to `id` against the other route's output
    ///
    /// Headphones win a shared device: the stream route stays unopened and
    /// flagged, and gets the headphones' binding back. A headphones bind to
    /// the stream route's device unbinds and flags the stream route.
    fn claim_device(&mut self, route: RouteId, id: &DeviceId) -> Option<DeviceBinding> {
        let other = route.other();
        let binding = self.routes[other.index()]
            .output
            .as_ref()
            .map(|o| o.binding.clone())
            .filter(|b| b.device.same_device(id))?;

        if route == RouteId::B {
            log::warn!("Stream route shares {} with headphones; not opening it", id);
            self.routes[route.index()].shared_device = true;
            return Some(binding);
        }
        log::warn!("Headphones route takes over {} from the stream route", id);
        self.unbind_route(other);
        self.routes[other.index()].shared_device = true;
        None
    }

    /// Bind a route to a virtual-time device
    ///
    /// The caller drives the returned output with
    /// [`SimulatedOutput::advance_to`] and the reconciler with
    /// [`Self::reconcile`]; no background threads are involved.
    pub fn bind_simulated(&mut self, route: RouteId, device: SimulatedDevice) -> SimulatedOutput {
        self.unbind_route(route);
        let (renderer, commands, monitor) =
            self.build_renderer(route, device.sample_rate, device.channels);
        let binding = DeviceBinding {
            device: DeviceId::with_host(&format!("simulated-{}", route), "Simulated"),
            sample_rate: device.sample_rate,
            block_size: device.block_size,
            channels: device.channels,
        };
        self.attach(
            route,
            BoundOutput {
                kind: OutputKind::Simulated,
                binding,
                commands,
                monitor,
                disconnect_reported: false,
            },
        );
        SimulatedOutput::new(renderer, device)
    }

    /// Close a route's output; the other route keeps playing
    pub fn unbind_route(&mut self, route: RouteId) {
        let slot = &mut self.routes[route.index()];
        slot.shared_device = false;
        let Some(output) = slot.output.take() else {
            return;
        };
        self.clock.set_route_active(route, false);
        output.monitor.request_shutdown();
        if matches!(output.kind, OutputKind::Device(_)) {
            wait_for_halt(&[&output.monitor]);
        }
        log::info!("Unbound {} route from {}", route, output.binding.device);
    }

    pub fn binding(&self, route: RouteId) -> Option<&DeviceBinding> {
        self.routes[route.index()].output.as_ref().map(|o| &o.binding)
    }

    fn preferred_rate(&self) -> Option<u32> {
        self.config
            .reference_sample_rate
            .or_else(|| self.session.as_ref().map(|s| s.sample_rate))
    }

    fn build_renderer(
        &self,
        route: RouteId,
        device_rate: u32,
        channels: u16,
    ) -> (RouteRenderer, rtrb::Producer<RendererCommand>, Arc<RouteMonitor>) {
        let (commands, consumer) = command_channel();
        let monitor = Arc::new(RouteMonitor::new());
        let renderer = RouteRenderer::new(
            RendererContext {
                route,
                clock: Arc::clone(&self.clock),
                snapshot: Arc::clone(&self.routes[route.index()].snapshot),
                monitor: Arc::clone(&monitor),
                commands: consumer,
                session: self.session.clone(),
                pitch_algorithm: self.config.pitch_algorithm,
            },
            device_rate,
            channels,
        );
        (renderer, commands, monitor)
    }

    fn attach(&mut self, route: RouteId, output: BoundOutput) {
        log::info!(
            "Bound {} route to {} ({}Hz, {} frames)",
            route,
            output.binding.device,
            output.binding.sample_rate,
            output.binding.block_size
        );
        self.routes[route.index()].output = Some(output);

        // Join at the canonical position rather than wherever this route
        // last stopped
        let position = self.clock.position();
        let cursor = CursorSample {
            start: position as f64,
            stamp_nanos: self.clock.now_nanos(),
            speed: 0.0,
        };
        self.clock.publish(route, cursor, position);
        self.clock.set_route_active(route, true);
        self.clock.resync();
    }

    fn ensure_sync_thread(&mut self) -> EngineResult<()> {
        if self.sync_thread.is_none() {
            let thread = SyncThread::spawn(Arc::clone(&self.reconciler), Arc::clone(&self.clock))
                .map_err(|e| DeviceError::Config(format!("failed to start sync thread: {}", e)))?;
            self.sync_thread = Some(thread);
        }
        Ok(())
    }

    fn send_command(&mut self, route: RouteId, command: RendererCommand) {
        if let Some(output) = self.routes[route.index()].output.as_mut() {
            if output.commands.push(command).is_err() {
                log::warn!("{} route command queue full; dropping command", route);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────

    /// Start or resume playback; restarts from 0 after the end
    pub fn play(&mut self) -> EngineResult<()> {
        if self.session.is_none() {
            return Err(ConfigError::NoSession.into());
        }
        self.clock.play();
        Ok(())
    }

    pub fn pause(&mut self) {
        self.clock.pause();
    }

    pub fn stop(&mut self) {
        self.clock.stop();
    }

    /// Seek to `seconds`, clamped to the session
    pub fn seek(&mut self, seconds: f64) {
        let frame = (seconds.max(0.0) * self.clock.sample_rate() as f64) as u64;
        self.clock.seek(frame);
    }

    /// Seek to a session frame, clamped to the session
    pub fn seek_frames(&mut self, frame: u64) {
        self.clock.seek(frame);
    }

    /// Skip forward or back by `seconds`
    pub fn seek_relative(&mut self, seconds: f64) {
        self.clock.seek_relative(seconds);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync and status
    // ─────────────────────────────────────────────────────────────────────

    /// Run one drift reconciliation step at clock time `now_nanos`
    pub fn reconcile(&self, now_nanos: u64) -> SyncReport {
        match self.reconciler.lock() {
            Ok(mut reconciler) => reconciler.tick(now_nanos),
            Err(_) => SyncReport::default(),
        }
    }

    /// Collect faults raised by the render side since the last poll
    ///
    /// A disconnected device pauses only its own route; the other route
    /// keeps playing. Rebinding the route recovers it.
    pub fn poll_faults(&mut self) -> Vec<EngineError> {
        let mut faults = Vec::new();

        for route in RouteId::ALL {
            let Some(output) = self.routes[route.index()].output.as_mut() else {
                continue;
            };
            if output.monitor.is_disconnected() && !output.disconnect_reported {
                output.disconnect_reported = true;
                log::warn!(
                    "{} route lost {}; pausing that route",
                    route,
                    output.binding.device
                );
                self.clock.set_route_active(route, false);
                faults.push(DeviceError::Disconnected { route }.into());
            }
        }

        if let Some(fault) = self.sync_monitor.take_fault() {
            faults.push(fault.into());
        }
        faults
    }

    pub fn status(&self) -> EngineStatus {
        let routes = RouteId::ALL.map(|route| {
            let slot = &self.routes[route.index()];
            let snapshot = slot.snapshot.get();
            let output = slot.output.as_ref();
            RouteStatus {
                route,
                binding: output.map(|o| o.binding.clone()),
                simulated: matches!(output.map(|o| &o.kind), Some(OutputKind::Simulated)),
                shared_device: slot.shared_device,
                disconnected: output.is_some_and(|o| o.monitor.is_disconnected()),
                levels: output.map(|o| o.monitor.levels()).unwrap_or([0.0; 2]),
                clipped_samples: output.map(|o| o.monitor.clipped_samples()).unwrap_or(0),
                consumed_frames: self.clock.consumed(route),
                nudged: self.sync_monitor.nudged() == Some(route),
                trims_db: snapshot.trims_db,
            }
        });

        let state = self.clock.state();
        EngineStatus {
            state,
            is_playing: state == TransportState::Playing,
            ended: self.clock.is_ended(),
            position_frames: self.clock.position(),
            position_secs: self.clock.position_secs(),
            duration_secs: self.session.as_ref().map_or(0.0, |s| s.duration_secs()),
            sample_rate: self.clock.sample_rate(),
            routes,
            drift_ms: self.sync_monitor.drift_ms(),
            sync_warning: self.sync_monitor.warning(),
            resyncs: self.sync_monitor.resyncs(),
        }
    }

    /// Stop everything and release devices
    ///
    /// Renderers are told to go silent, given a bounded time to
    /// acknowledge, then their streams are closed regardless.
    pub fn teardown(&mut self) {
        self.clock.stop();
        if let Some(mut thread) = self.sync_thread.take() {
            thread.stop();
        }

        let outputs: Vec<BoundOutput> = self
            .routes
            .iter_mut()
            .filter_map(|slot| slot.output.take())
            .collect();
        if outputs.is_empty() && self.session.is_none() {
            return;
        }

        for output in &outputs {
            output.monitor.request_shutdown();
        }
        let waiting: Vec<&Arc<RouteMonitor>> = outputs
            .iter()
            .filter(|o| matches!(o.kind, OutputKind::Device(_)) && !o.monitor.is_disconnected())
            .map(|o| &o.monitor)
            .collect();
        wait_for_halt(&waiting);

        for route in RouteId::ALL {
            self.clock.set_route_active(route, false);
        }
        drop(outputs);
        self.session = None;
        log::info!("Playback engine torn down");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Wait until every monitor reports halted, or the teardown timeout passes
fn wait_for_halt(monitors: &[&Arc<RouteMonitor>]) {
    let deadline = Instant::now() + TEARDOWN_TIMEOUT;
    while !monitors.iter().all(|m| m.is_halted()) {
        if Instant::now() >= deadline {
            log::warn!("Renderer did not acknowledge shutdown in time; closing anyway");
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioFormat, DecodeError, DecodeResult, DecodedAudio, EncodeResult};
    use crate::engine::route::StemGain;
    use std::collections::HashMap;

    const RATE: u32 = 44100;

    /// Codec serving generated sine stems
    struct SineCodec {
        files: HashMap<PathBuf, DecodedAudio>,
    }

    impl SineCodec {
        fn new(seconds: f32) -> Self {
            let frames = (seconds * RATE as f32) as usize;
            let mut files = HashMap::new();
            files.insert(PathBuf::from("instrumental.wav"), sine(220.0, frames));
            files.insert(PathBuf::from("vocal.wav"), sine(1000.0, frames));
            Self { files }
        }
    }

    impl CodecService for SineCodec {
        fn decode(&self, path: &Path) -> DecodeResult<DecodedAudio> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| DecodeError::NotFound {
                    path: path.to_path_buf(),
                })
        }

        fn encode(&self, _: &DecodedAudio, path: &Path, _: AudioFormat) -> EncodeResult<PathBuf> {
            Ok(path.to_path_buf())
        }
    }

    fn sine(freq: f32, frames: usize) -> DecodedAudio {
        let samples = (0..frames)
            .flat_map(|i| {
                let phase = 2.0 * std::f64::consts::PI * freq as f64 * i as f64 / RATE as f64;
                let v = (0.1 * phase.sin()) as f32;
                [v, v]
            })
            .collect();
        DecodedAudio::new(samples, RATE, 2)
    }

    fn engine(seconds: f32) -> PlaybackEngine {
        let mut engine = PlaybackEngine::new(EngineConfig::default(), Arc::new(SineCodec::new(seconds)));
        engine
            .load_session(Path::new("instrumental.wav"), Path::new("vocal.wav"))
            .unwrap();
        engine
    }

    /// Mean Hann-windowed Goertzel power of the left channel around `freq`
    fn tone_power(interleaved: &[f32], channels: usize, freq: f64) -> f64 {
        const WINDOW: usize = 4096;
        let coeff = 2.0 * (2.0 * std::f64::consts::PI * freq / RATE as f64).cos();
        let left: Vec<f64> = interleaved
            .chunks_exact(channels)
            .map(|frame| frame[0] as f64)
            .collect();

        let mut total = 0.0;
        let mut blocks = 0;
        for block in left.chunks_exact(WINDOW) {
            let (mut s1, mut s2) = (0.0f64, 0.0f64);
            for (i, x) in block.iter().enumerate() {
                let w = 0.5
                    - 0.5 * (2.0 * std::f64::consts::PI * i as f64 / WINDOW as f64).cos();
                let s = x * w + coeff * s1 - s2;
                s2 = s1;
                s1 = s;
            }
            total += (s1 * s1 + s2 * s2 - coeff * s1 * s2) / (WINDOW as f64).powi(2);
            blocks += 1;
        }
        total / blocks.max(1) as f64
    }

    #[test]
    fn test_play_requires_session() {
        let mut engine = PlaybackEngine::new(EngineConfig::default(), Arc::new(SineCodec::new(1.0)));
        assert!(matches!(
            engine.play(),
            Err(EngineError::Config(ConfigError::NoSession))
        ));
    }

    #[test]
    fn test_load_reports_session() {
        let engine = engine(3.0);
        let info = engine.session_info().unwrap();
        assert_eq!(info.sample_rate, RATE);
        assert_eq!(info.frames, 3 * RATE as u64);
        assert!(info.stems[0].lufs.is_some());

        let status = engine.status();
        assert_eq!(status.state, TransportState::Stopped);
        assert_eq!(status.position_frames, 0);
        assert!((status.duration_secs - 3.0).abs() < 1e-9);
        // Loudness trims follow the -14 LUFS default target
        assert!(status.routes[0].trims_db[0] > 0.0);
    }

    #[test]
    fn test_failed_load_keeps_previous_session() {
        let mut engine = engine(2.0);
        let err = engine
            .load_session(Path::new("instrumental.wav"), Path::new("missing.wav"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
        assert_eq!(engine.session_info().unwrap().frames, 2 * RATE as u64);
    }

    #[test]
    fn test_seek_then_status_reports_position() {
        let mut engine = engine(10.0);
        let mut a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));

        // Stopped
        engine.seek(2.0);
        assert_eq!(engine.status().position_frames, 2 * RATE as u64);

        // Playing, before any renderer has caught up
        engine.play().unwrap();
        a.advance_to(50_000_000);
        engine.seek(5.0);
        assert_eq!(engine.status().position_frames, 5 * RATE as u64);
        a.advance_to(60_000_000);
        let status = engine.status();
        assert_eq!(status.state, TransportState::Playing);
        assert!(status.position_frames >= 5 * RATE as u64);

        // Out of range
        engine.seek(99.0);
        assert_eq!(engine.status().position_frames, 10 * RATE as u64 - 1);
    }

    #[test]
    fn test_configure_route_shares_pitch_and_validates() {
        let mut engine = engine(1.0);
        let config = RouteConfig {
            pitch_semitones: 3.0,
            ..RouteConfig::stream()
        };
        engine.configure_route(RouteId::B, config).unwrap();
        assert_eq!(engine.route_config(RouteId::A).pitch_semitones, 3.0);

        let bad = RouteConfig {
            instrumental: StemGain::db(f32::NAN),
            ..RouteConfig::headphones()
        };
        assert!(engine.configure_route(RouteId::A, bad).is_err());
        assert_eq!(engine.route_config(RouteId::A).instrumental.gain_db, 0.0);
    }

    #[test]
    fn test_unbound_route_is_silent_partner() {
        let mut engine = engine(2.0);
        let mut a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        engine.play().unwrap();
        a.advance_to(1_000_000_000);
        let status = engine.status();
        assert!(status.routes[1].binding.is_none());
        assert!(status.routes[0].simulated);
        assert_eq!(status.routes[1].consumed_frames, 0);
        assert!(status.routes[0].levels[0] > 0.0);
    }

    #[test]
    fn test_playback_ends_and_restarts() {
        let mut engine = engine(1.0);
        let mut a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        engine.play().unwrap();
        a.advance_to(1_100_000_000);

        let status = engine.status();
        assert!(status.ended);
        assert_eq!(status.state, TransportState::Stopped);
        assert_eq!(status.position_frames, RATE as u64 - 1);

        engine.play().unwrap();
        a.advance_to(1_200_000_000);
        let status = engine.status();
        assert_eq!(status.state, TransportState::Playing);
        assert!(!status.ended);
        assert!(status.position_frames < RATE as u64 / 2);
    }

    #[test]
    fn test_routes_stay_within_drift_bound() {
        let mut engine = engine(70.0);
        // 10ms blocks against 7ms blocks on a crystal running 0.2% fast
        let mut a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        let mut b = engine.bind_simulated(
            RouteId::B,
            SimulatedDevice::new(RATE, 309).with_skew(1.002),
        );
        let max_drift = engine.config().sync.max_drift_ms;
        // Both devices snap to the start before the transport runs
        a.advance_to(0);
        b.advance_to(0);
        engine.play().unwrap();

        let interval = engine.config().sync.interval_ms * 1_000_000;
        let mut now = 0;
        let mut nudges = 0;
        while now <= 60_000_000_000u64 {
            a.advance_to(now);
            b.advance_to(now);
            let report = engine.reconcile(now);
            if let Some(drift) = report.drift_ms {
                assert!(drift.abs() < max_drift, "drift {}ms at {}ns", drift, now);
            }
            assert!(!report.resynced);
            if report.nudged == Some(RouteId::B) {
                nudges += 1;
            }
            now += interval;
        }

        assert!(nudges > 0);
        assert!(engine.poll_faults().is_empty());
        let status = engine.status();
        assert!(status.sync_warning.is_none());
        let consumed = [status.routes[0].consumed_frames, status.routes[1].consumed_frames];
        let gap = consumed[0].abs_diff(consumed[1]) as f64 / RATE as f64 * 1000.0;
        assert!(gap < max_drift as f64, "consumption gap {}ms", gap);
    }

    #[test]
    fn test_three_minute_dual_route_session() {
        let mut engine = engine(180.0);
        let block = 441u64;
        let mut a = engine
            .bind_simulated(RouteId::A, SimulatedDevice::new(RATE, block as u32))
            .with_capture();
        let mut b = engine
            .bind_simulated(RouteId::B, SimulatedDevice::new(RATE, block as u32))
            .with_capture();

        let route_a = RouteConfig {
            pitch_semitones: 2.0,
            ..RouteConfig::headphones()
        };
        let route_b = RouteConfig {
            vocal: StemGain::db(f32::NEG_INFINITY),
            pitch_semitones: 2.0,
            ..RouteConfig::headphones()
        };
        engine.configure_route(RouteId::A, route_a).unwrap();
        engine.configure_route(RouteId::B, route_b).unwrap();
        a.advance_to(0);
        b.advance_to(0);
        engine.play().unwrap();

        // Callbacks 1..=1000 play: 10 seconds at 10ms per block
        let mut now = 0;
        while now < 10_000_000_000u64 {
            now += 1_000_000;
            a.advance_to(now);
            b.advance_to(now);
            if now % 50_000_000 == 0 {
                engine.reconcile(now);
            }
        }
        assert_eq!(a.callbacks(), 1001);

        let status = engine.status();
        for route in &status.routes {
            assert!(
                route.consumed_frames.abs_diff(441_000) <= block,
                "{} consumed {}",
                route.route,
                route.consumed_frames
            );
        }

        // Vocal at 1000Hz shifted up 2 semitones
        let vocal_freq = 1000.0 * 2f64.powf(2.0 / 12.0);
        let instr_freq = 220.0 * 2f64.powf(2.0 / 12.0);
        let skip = RATE as usize * 2 * 2;
        let captured_a = &a.captured()[skip..];
        let captured_b = &b.captured()[skip..];

        let vocal_a = tone_power(captured_a, 2, vocal_freq);
        let vocal_b = tone_power(captured_b, 2, vocal_freq);
        assert!(vocal_a > 1e-5, "vocal missing on route A: {}", vocal_a);
        assert!(vocal_b < vocal_a * 1e-3, "vocal leaked to route B: {} vs {}", vocal_b, vocal_a);

        // Instrumental is present on both
        assert!(tone_power(captured_b, 2, instr_freq) > 1e-5);
        assert!(captured_b.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_disconnect_pauses_only_that_route() {
        let mut engine = engine(5.0);
        let mut a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        let mut b = engine.bind_simulated(RouteId::B, SimulatedDevice::new(RATE, 441));
        engine.play().unwrap();
        a.advance_to(500_000_000);
        b.advance_to(500_000_000);

        b.renderer().monitor().mark_disconnected();
        let faults = engine.poll_faults();
        assert_eq!(faults.len(), 1);
        assert!(matches!(
            faults[0],
            EngineError::Device(DeviceError::Disconnected { route: RouteId::B })
        ));
        assert!(engine.poll_faults().is_empty());

        let frozen = engine.status().routes[1].consumed_frames;
        a.advance_to(1_500_000_000);
        b.advance_to(1_500_000_000);
        let status = engine.status();
        assert!(status.is_playing);
        assert!(status.routes[1].disconnected);
        assert_eq!(status.routes[1].consumed_frames, frozen);
        assert!(status.routes[0].consumed_frames > frozen + RATE as u64 / 2);
        // Position follows the surviving route
        assert!(status.position_frames > RATE as u64);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut engine = engine(1.0);
        let _a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        engine.teardown();
        assert!(!engine.has_session());
        assert!(engine.binding(RouteId::A).is_none());
        // Idempotent
        engine.teardown();
    }

    #[test]
    fn test_stream_route_on_headphones_device_is_flagged_shared() {
        let mut engine = engine(1.0);
        let _a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        let device = engine.binding(RouteId::A).unwrap().device.clone();

        let binding = engine.claim_device(RouteId::B, &device).unwrap();
        assert_eq!(binding.device, device);
        let status = engine.status();
        assert!(status.routes[1].shared_device);
        assert!(status.routes[1].binding.is_none());
        assert!(!status.routes[0].shared_device);
        assert!(engine.binding(RouteId::A).is_some());

        // A different device is not shared
        assert!(engine
            .claim_device(RouteId::B, &DeviceId::with_host("other", "Simulated"))
            .is_none());
    }

    #[test]
    fn test_headphones_take_over_stream_device() {
        let mut engine = engine(1.0);
        let _b = engine.bind_simulated(RouteId::B, SimulatedDevice::new(RATE, 441));
        let device = engine.binding(RouteId::B).unwrap().device.clone();

        assert!(engine.claim_device(RouteId::A, &device).is_none());
        assert!(engine.binding(RouteId::B).is_none());
        assert!(engine.status().routes[1].shared_device);

        // Rebinding the stream route clears the flag
        let _b = engine.bind_simulated(RouteId::B, SimulatedDevice::new(RATE, 441));
        assert!(!engine.status().routes[1].shared_device);
    }

    #[test]
    fn test_relative_seeks_accumulate_while_seeking() {
        let mut engine = engine(30.0);
        let mut a = engine.bind_simulated(RouteId::A, SimulatedDevice::new(RATE, 441));
        engine.play().unwrap();
        a.advance_to(0);

        engine.seek(10.0);
        engine.seek_relative(5.0);
        engine.seek_relative(5.0);
        engine.seek_relative(-2.0);
        let status = engine.status();
        assert_eq!(status.state, TransportState::Seeking);
        assert_eq!(status.position_frames, 18 * RATE as u64);

        a.advance_to(10_000_000);
        let status = engine.status();
        assert_eq!(status.state, TransportState::Playing);
        assert!(status.position_frames >= 18 * RATE as u64);
        assert!(status.position_frames <= 18 * RATE as u64 + 441);
    }
}
