//! Inter-route drift reconciliation
//!
//! Two independent devices never run at exactly the same rate. The
//! [`DriftReconciler`] compares the routes' published cursors at a common
//! instant and, when one pulls ahead, slows its read rate by a small fixed
//! ratio until the other catches up. The nudge is a resampling-rate change
//! inside the renderer, so it never skips or repeats frames; at the default
//! 0.5% it is a pitch wobble of under 9 cents.
//!
//! Drift beyond the resync threshold is treated as a discontinuity (a stalled
//! device, a suspended laptop) and both routes are hard-seeked to the
//! canonical position instead. Drift that stays above the ceiling for too
//! many ticks raises a non-fatal [`SyncFault`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::clock::{Clock, TransportState};
use crate::config::DriftPolicy;
use crate::error::SyncFault;
use crate::types::RouteId;

/// Longest a cursor is extrapolated past its last callback
pub const MAX_EXTRAPOLATION_NANOS: u64 = 100_000_000;

/// Outcome of one reconciliation tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncReport {
    /// Route A minus route B in milliseconds; `None` when not comparable
    pub drift_ms: Option<f32>,
    /// Route currently being slowed down
    pub nudged: Option<RouteId>,
    pub resynced: bool,
    /// Raised on the tick the fault threshold was crossed
    pub fault: Option<SyncFault>,
}

/// Reconciliation state visible to the control thread
pub struct SyncMonitor {
    drift_ms: AtomicU32,
    comparable: AtomicBool,
    nudged: AtomicU8,
    resyncs: AtomicU64,
    fault_drift_ms: AtomicU32,
    fault_ticks: AtomicU32,
    fault_active: AtomicBool,
    fault_unreported: AtomicBool,
}

impl SyncMonitor {
    pub fn new() -> Self {
        Self {
            drift_ms: AtomicU32::new(0f32.to_bits()),
            comparable: AtomicBool::new(false),
            nudged: AtomicU8::new(0),
            resyncs: AtomicU64::new(0),
            fault_drift_ms: AtomicU32::new(0f32.to_bits()),
            fault_ticks: AtomicU32::new(0),
            fault_active: AtomicBool::new(false),
            fault_unreported: AtomicBool::new(false),
        }
    }

    /// Last measured drift, route A minus route B
    pub fn drift_ms(&self) -> Option<f32> {
        self.comparable
            .load(Ordering::Acquire)
            .then(|| f32::from_bits(self.drift_ms.load(Ordering::Relaxed)))
    }

    pub fn nudged(&self) -> Option<RouteId> {
        match self.nudged.load(Ordering::Relaxed) {
            0 => None,
            bits => RouteId::ALL.into_iter().find(|r| r.bit() == bits),
        }
    }

    /// Hard resyncs performed since the engine started
    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// The fault currently in effect, if drift is still out of bounds
    pub fn warning(&self) -> Option<SyncFault> {
        self.fault_active
            .load(Ordering::Acquire)
            .then(|| self.fault_snapshot())
    }

    /// Take a fault raised since the last call
    pub fn take_fault(&self) -> Option<SyncFault> {
        self.fault_unreported
            .swap(false, Ordering::AcqRel)
            .then(|| self.fault_snapshot())
    }

    fn fault_snapshot(&self) -> SyncFault {
        SyncFault {
            drift_ms: f32::from_bits(self.fault_drift_ms.load(Ordering::Relaxed)),
            ticks: self.fault_ticks.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &SyncReport) {
        match report.drift_ms {
            Some(drift) => {
                self.drift_ms.store(drift.to_bits(), Ordering::Relaxed);
                self.comparable.store(true, Ordering::Release);
            }
            None => self.comparable.store(false, Ordering::Release),
        }
        self.nudged.store(
            report.nudged.map(RouteId::bit).unwrap_or(0),
            Ordering::Relaxed,
        );
        if report.resynced {
            self.resyncs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn raise(&self, fault: SyncFault) {
        self.fault_drift_ms
            .store(fault.drift_ms.to_bits(), Ordering::Relaxed);
        self.fault_ticks.store(fault.ticks, Ordering::Relaxed);
        self.fault_active.store(true, Ordering::Release);
        self.fault_unreported.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.fault_active.store(false, Ordering::Release);
    }
}

impl Default for SyncMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares route cursors and trims read rates
pub struct DriftReconciler {
    clock: Arc<Clock>,
    monitor: Arc<SyncMonitor>,
    policy: DriftPolicy,
    nudged: Option<RouteId>,
    over_ticks: u32,
}

impl DriftReconciler {
    pub fn new(clock: Arc<Clock>, monitor: Arc<SyncMonitor>, policy: DriftPolicy) -> Self {
        Self {
            clock,
            monitor,
            policy: policy.sanitized(),
            nudged: None,
            over_ticks: 0,
        }
    }

    pub fn policy(&self) -> &DriftPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: DriftPolicy) {
        self.policy = policy.sanitized();
    }

    /// Forget any nudge and fault progress
    pub fn reset(&mut self) {
        self.release();
        self.over_ticks = 0;
        self.monitor.clear();
    }

    /// Run one reconciliation step at clock time `now_nanos`
    pub fn tick(&mut self, now_nanos: u64) -> SyncReport {
        let report = self.evaluate(now_nanos);
        self.monitor.record(&report);
        report
    }

    fn evaluate(&mut self, now_nanos: u64) -> SyncReport {
        let Some(drift_ms) = self.measure(now_nanos) else {
            self.release();
            self.over_ticks = 0;
            return SyncReport::default();
        };
        let magnitude = drift_ms.abs();

        if magnitude >= self.policy.resync_ms {
            log::warn!(
                "Route drift of {:.1}ms exceeds {:.0}ms; resyncing both routes",
                drift_ms,
                self.policy.resync_ms
            );
            self.release();
            self.over_ticks = 0;
            self.clock.resync();
            return SyncReport {
                drift_ms: Some(drift_ms),
                resynced: true,
                ..SyncReport::default()
            };
        }

        // Positive drift: route A is ahead
        let leader = if drift_ms > 0.0 { RouteId::A } else { RouteId::B };
        match self.nudged {
            Some(route) if route != leader || magnitude <= self.policy.release_ms => {
                self.release();
            }
            _ => {}
        }
        if self.nudged.is_none() && magnitude > self.policy.engage_ms {
            self.clock
                .set_rate_trim(leader, 1.0 - self.policy.nudge_ratio);
            self.nudged = Some(leader);
            log::debug!("Slowing {} route to close {:.2}ms of drift", leader, drift_ms);
        }

        let mut fault = None;
        if magnitude > self.policy.max_drift_ms {
            self.over_ticks += 1;
            if self.over_ticks == self.policy.fault_ticks {
                let raised = SyncFault {
                    drift_ms,
                    ticks: self.over_ticks,
                };
                log::warn!("{}", raised);
                self.monitor.raise(raised);
                fault = Some(raised);
            }
        } else {
            if self.over_ticks >= self.policy.fault_ticks {
                log::info!("Route drift back within {:.0}ms", self.policy.max_drift_ms);
            }
            self.over_ticks = 0;
            self.monitor.clear();
        }

        SyncReport {
            drift_ms: Some(drift_ms),
            nudged: self.nudged,
            resynced: false,
            fault,
        }
    }

    /// Drift in ms between the routes, when both are playing
    fn measure(&self, now_nanos: u64) -> Option<f32> {
        if self.clock.state() != TransportState::Playing {
            return None;
        }
        let comparable = RouteId::ALL.iter().all(|&r| {
            self.clock.is_route_active(r) && !self.clock.is_route_ended(r)
        });
        if !comparable {
            return None;
        }

        let a = self.clock.cursor(RouteId::A);
        let b = self.clock.cursor(RouteId::B);
        if a.speed == 0.0 || b.speed == 0.0 {
            return None;
        }

        let frames = a.estimate(now_nanos, MAX_EXTRAPOLATION_NANOS)
            - b.estimate(now_nanos, MAX_EXTRAPOLATION_NANOS);
        let rate = self.clock.sample_rate().max(1) as f64;
        Some((frames / rate * 1000.0) as f32)
    }

    fn release(&mut self) {
        if let Some(route) = self.nudged.take() {
            self.clock.set_rate_trim(route, 1.0);
        }
    }
}

/// Background thread ticking a shared reconciler at the policy interval
pub struct SyncThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SyncThread {
    pub fn spawn(
        reconciler: Arc<Mutex<DriftReconciler>>,
        clock: Arc<Clock>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("duet-sync".to_string())
            .spawn(move || {
                log::debug!("Drift reconciler started");
                while !thread_stop.load(Ordering::Acquire) {
                    let interval = match reconciler.lock() {
                        Ok(mut r) => {
                            r.tick(clock.now_nanos());
                            r.policy().interval_ms
                        }
                        Err(_) => {
                            log::error!("Drift reconciler lock poisoned; stopping");
                            break;
                        }
                    };
                    thread::sleep(Duration::from_millis(interval));
                }
                log::debug!("Drift reconciler stopped");
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Drift reconciler thread panicked");
            }
        }
    }
}

impl Drop for SyncThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::CursorSample;

    const RATE: f64 = 44100.0;

    fn playing_clock() -> Arc<Clock> {
        let clock = Arc::new(Clock::new());
        clock.reset(RATE as u64 * 600, RATE as u32);
        clock.set_route_active(RouteId::A, true);
        clock.set_route_active(RouteId::B, true);
        clock.play();
        clock
    }

    fn publish(clock: &Clock, route: RouteId, frame: f64, stamp: u64) {
        let sample = CursorSample {
            start: frame,
            stamp_nanos: stamp,
            speed: RATE,
        };
        clock.publish(route, sample, frame as u64);
    }

    fn reconciler(clock: &Arc<Clock>) -> DriftReconciler {
        DriftReconciler::new(
            Arc::clone(clock),
            Arc::new(SyncMonitor::new()),
            DriftPolicy::default(),
        )
    }

    #[test]
    fn test_nothing_to_compare_when_paused() {
        let clock = playing_clock();
        clock.pause();
        let mut r = reconciler(&clock);
        assert_eq!(r.tick(0), SyncReport::default());
    }

    #[test]
    fn test_extrapolates_to_common_instant() {
        let clock = playing_clock();
        // B published 10ms later at a position 10ms further on: no drift
        publish(&clock, RouteId::A, 0.0, 0);
        publish(&clock, RouteId::B, 441.0, 10_000_000);
        let mut r = reconciler(&clock);
        let report = r.tick(20_000_000);
        assert!(report.drift_ms.unwrap().abs() < 1e-3);
        assert_eq!(report.nudged, None);
    }

    #[test]
    fn test_leader_is_slowed_then_released() {
        let clock = playing_clock();
        let mut r = reconciler(&clock);

        // B is 8ms ahead
        publish(&clock, RouteId::A, 10_000.0, 0);
        publish(&clock, RouteId::B, 10_000.0 + 0.008 * RATE, 0);
        let report = r.tick(0);
        assert_eq!(report.nudged, Some(RouteId::B));
        assert!((clock.rate_trim(RouteId::B) - 0.995).abs() < 1e-6);
        assert_eq!(clock.rate_trim(RouteId::A), 1.0);

        // Still outside the release band: keep nudging
        publish(&clock, RouteId::B, 10_000.0 + 0.003 * RATE, 0);
        assert_eq!(r.tick(0).nudged, Some(RouteId::B));

        // Caught up
        publish(&clock, RouteId::B, 10_000.0 + 0.0005 * RATE, 0);
        assert_eq!(r.tick(0).nudged, None);
        assert_eq!(clock.rate_trim(RouteId::B), 1.0);
    }

    #[test]
    fn test_large_drift_forces_resync() {
        let clock = playing_clock();
        let mut r = reconciler(&clock);
        publish(&clock, RouteId::A, 100_000.0, 0);
        publish(&clock, RouteId::B, 100_000.0 + RATE, 0);

        let report = r.tick(0);
        assert!(report.resynced);
        assert_eq!(clock.state(), TransportState::Seeking);
        assert_eq!(clock.seek_target(), 100_000);
    }

    #[test]
    fn test_persistent_drift_raises_fault_once() {
        let clock = playing_clock();
        let monitor = Arc::new(SyncMonitor::new());
        let policy = DriftPolicy {
            fault_ticks: 3,
            ..DriftPolicy::default()
        };
        let mut r = DriftReconciler::new(Arc::clone(&clock), Arc::clone(&monitor), policy);

        publish(&clock, RouteId::A, 0.0, 0);
        publish(&clock, RouteId::B, 0.05 * RATE, 0);
        assert_eq!(r.tick(0).fault, None);
        assert_eq!(r.tick(0).fault, None);
        let fault = r.tick(0).fault.unwrap();
        assert_eq!(fault.ticks, 3);
        assert!(r.tick(0).fault.is_none());

        assert!(monitor.warning().is_some());
        assert!(monitor.take_fault().is_some());
        assert!(monitor.take_fault().is_none());

        publish(&clock, RouteId::B, 0.0, 0);
        r.tick(0);
        assert!(monitor.warning().is_none());
    }

    #[test]
    fn test_sync_thread_stops() {
        let clock = Arc::new(Clock::new());
        let r = Arc::new(Mutex::new(reconciler(&clock)));
        let mut thread = SyncThread::spawn(r, clock).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        thread.stop();
    }
}
