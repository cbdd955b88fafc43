//! Virtual-time output devices
//!
//! A [`SimulatedOutput`] drives a [`RouteRenderer`] the way a device
//! callback would, but on a virtual clock: callbacks fire at
//! `block / (rate * skew)` second intervals and are stamped with that
//! virtual time. A skew of `1.002` models a device crystal running 0.2%
//! fast. Used for headless rendering and for exercising synchronization
//! without hardware.

use super::renderer::RouteRenderer;
use crate::types::RouteId;

/// Shape of a simulated device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedDevice {
    pub sample_rate: u32,
    pub block_size: u32,
    pub channels: u16,
    /// Actual over nominal clock rate
    pub skew: f64,
}

impl SimulatedDevice {
    pub fn new(sample_rate: u32, block_size: u32) -> Self {
        Self {
            sample_rate,
            block_size,
            channels: 2,
            skew: 1.0,
        }
    }

    pub fn with_skew(mut self, skew: f64) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Real-time length of one callback in nanoseconds
    pub fn period_nanos(&self) -> f64 {
        self.block_size as f64 / (self.sample_rate as f64 * self.skew) * 1e9
    }
}

/// A renderer attached to a virtual device
pub struct SimulatedOutput {
    device: SimulatedDevice,
    renderer: RouteRenderer,
    buffer: Vec<f32>,
    callbacks: u64,
    capture: Option<Vec<f32>>,
}

impl SimulatedOutput {
    pub fn new(renderer: RouteRenderer, device: SimulatedDevice) -> Self {
        let len = device.block_size as usize * renderer.channels();
        Self {
            device,
            renderer,
            buffer: vec![0.0; len],
            callbacks: 0,
            capture: None,
        }
    }

    /// Keep every rendered sample for later inspection
    pub fn with_capture(mut self) -> Self {
        self.capture = Some(Vec::new());
        self
    }

    pub fn route(&self) -> RouteId {
        self.renderer.route()
    }

    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }

    pub fn renderer(&self) -> &RouteRenderer {
        &self.renderer
    }

    pub fn callbacks(&self) -> u64 {
        self.callbacks
    }

    /// Virtual time of the next callback
    pub fn next_callback_nanos(&self) -> u64 {
        (self.callbacks as f64 * self.device.period_nanos()).round() as u64
    }

    /// Run every callback due at or before `now_nanos`
    pub fn advance_to(&mut self, now_nanos: u64) {
        loop {
            let stamp = self.next_callback_nanos();
            if stamp > now_nanos {
                break;
            }
            self.renderer.render(&mut self.buffer, stamp);
            if let Some(capture) = self.capture.as_mut() {
                capture.extend_from_slice(&self.buffer);
            }
            self.callbacks += 1;
        }
    }

    /// Captured interleaved output
    pub fn captured(&self) -> &[f32] {
        self.capture.as_deref().unwrap_or(&[])
    }

    /// Take the captured output, leaving capture enabled
    pub fn take_captured(&mut self) -> Vec<f32> {
        self.capture
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period() {
        let device = SimulatedDevice::new(44100, 441);
        assert!((device.period_nanos() - 10_000_000.0).abs() < 1e-3);

        let fast = device.with_skew(2.0);
        assert!((fast.period_nanos() - 5_000_000.0).abs() < 1e-3);
    }
}
