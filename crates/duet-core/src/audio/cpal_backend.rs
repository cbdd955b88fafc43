//! CPAL output streams for route renderers
//!
//! Each bound route gets its own output stream, possibly on its own
//! device. The stream callback owns the route's [`RouteRenderer`] outright,
//! so the two routes never share a lock:
//!
//! ```text
//!                    ┌───────────────────────┐
//!   Control  ───────►│  Clock (atomics)      │◄──────── Drift reconciler
//!   thread           └──────┬─────────┬──────┘
//!       │ rtrb              │         │
//!       ▼                   ▼         ▼
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ cmd queue A  │──►│ Stream A     │   │ Stream B     │◄── cmd queue B
//!  └──────────────┘   │ (renderer A) │   │ (renderer B) │
//!                     └──────────────┘   └──────────────┘
//! ```

use std::sync::Arc;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use super::config::{BufferSize, DeviceBinding, DeviceId};
use super::error::{DeviceError, DeviceResult};
use crate::engine::{Clock, RouteMonitor, RouteRenderer};
use crate::types::{RouteId, DEFAULT_SAMPLE_RATE};

/// Negotiated stream parameters for one device
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub config: StreamConfig,
    pub binding: DeviceBinding,
}

/// A running route output; dropping it closes the stream
pub struct RouteStream {
    _stream: Stream,
    binding: DeviceBinding,
}

impl RouteStream {
    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn sample_rate(&self) -> u32 {
        self.binding.sample_rate
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        self.binding.block_ms()
    }
}

/// Pick a stream configuration for `device`
///
/// Prefers f32 output, at least two channels and `preferred_rate`
/// (default 44.1kHz). When the device can't run at that rate the closest
/// supported rate is used and the renderer resamples on the fly.
pub fn plan_stream(
    device: &cpal::Device,
    id: &DeviceId,
    preferred_rate: Option<u32>,
    buffer_size: BufferSize,
) -> DeviceResult<StreamPlan> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| DeviceError::Config(e.to_string()))?
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if supported.is_empty() {
        return Err(DeviceError::UnsupportedFormat(format!(
            "{} has no f32 output configuration",
            id
        )));
    }

    let target_rate = preferred_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let in_range = |c: &&cpal::SupportedStreamConfigRange| {
        target_rate >= c.min_sample_rate().0 && target_rate <= c.max_sample_rate().0
    };

    let best = supported
        .iter()
        .filter(|c| c.channels() >= 2)
        .find(in_range)
        .or_else(|| supported.iter().find(in_range))
        .or_else(|| supported.iter().find(|c| c.channels() >= 2))
        .or_else(|| supported.first())
        .ok_or_else(|| DeviceError::Config("No suitable output configuration".to_string()))?;

    let sample_rate = if in_range(&best) {
        target_rate
    } else {
        let fallback = target_rate.clamp(best.min_sample_rate().0, best.max_sample_rate().0);
        log::warn!(
            "{} doesn't support {}Hz, using {}Hz (resampled while rendering)",
            id,
            target_rate,
            fallback
        );
        fallback
    };

    let block_size = buffer_size.frames();
    let supported_config = best.clone().with_sample_rate(cpal::SampleRate(sample_rate));
    let config = StreamConfig {
        channels: supported_config.channels(),
        sample_rate: supported_config.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(block_size),
    };

    log::debug!(
        "Selected {} channels, {}Hz, {} frames for {}",
        config.channels,
        sample_rate,
        block_size,
        id
    );

    Ok(StreamPlan {
        binding: DeviceBinding {
            device: id.clone(),
            sample_rate,
            block_size,
            channels: config.channels,
        },
        config,
    })
}

/// Build and start the output stream driving `renderer`
///
/// A device that disappears sets the route monitor's disconnected flag; the
/// control thread turns that into a recoverable error when it polls.
pub fn start_stream(
    device: &cpal::Device,
    plan: &StreamPlan,
    mut renderer: RouteRenderer,
    clock: Arc<Clock>,
) -> DeviceResult<RouteStream> {
    let route: RouteId = renderer.route();
    let monitor: Arc<RouteMonitor> = Arc::clone(renderer.monitor());

    let stream = device
        .build_output_stream(
            &plan.config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                renderer.render(data, clock.now_nanos());
            },
            move |err| {
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    monitor.mark_disconnected();
                }
                log::error!("Audio stream error on {} route: {}", route, err);
            },
            None,
        )
        .map_err(|e| DeviceError::StreamBuild(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::StreamPlay(e.to_string()))?;

    log::info!(
        "{} route streaming to {}: {} channels, {}Hz, {} frames (~{:.1}ms)",
        route,
        plan.binding.device,
        plan.binding.channels,
        plan.binding.sample_rate,
        plan.binding.block_size,
        plan.binding.block_ms()
    );

    Ok(RouteStream {
        _stream: stream,
        binding: plan.binding.clone(),
    })
}
