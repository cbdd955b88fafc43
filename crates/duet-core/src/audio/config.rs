//! Output device identifiers and stream negotiation settings

use serde::{Deserialize, Serialize};

/// Largest block a renderer processes in one pass (frames)
///
/// Device callbacks asking for more are rendered in several passes.
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Block size used when the configuration leaves it to us (frames)
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Block size chosen in low-latency mode (frames, ~5.8ms at 44.1kHz)
pub const LOW_LATENCY_BLOCK_SIZE: u32 = 256;

/// Smallest fixed block size accepted from configuration
pub const MIN_BLOCK_SIZE: u32 = 32;

/// Preferred buffer size for route streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferSize {
    /// Let the engine choose ([`DEFAULT_BLOCK_SIZE`])
    #[default]
    Default,
    /// Request a specific size in frames (clamped to a sane range)
    Fixed(u32),
    /// Smallest size that is usually stable
    LowLatency,
}

impl BufferSize {
    /// Block size to request from the device, in frames
    pub fn frames(&self) -> u32 {
        match self {
            BufferSize::Default => DEFAULT_BLOCK_SIZE,
            BufferSize::Fixed(frames) => (*frames).clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE as u32),
            BufferSize::LowLatency => LOW_LATENCY_BLOCK_SIZE,
        }
    }

    /// Output latency of one block in milliseconds
    pub fn latency_ms(&self, sample_rate: u32) -> f32 {
        self.frames() as f32 / sample_rate as f32 * 1000.0
    }
}

/// Audio device identifier
///
/// Names alone are ambiguous on Linux, where the same card shows up under
/// ALSA and JACK, so the host is kept alongside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Device name as reported by the host
    pub name: String,
    /// Host backend ("ALSA", "JACK", "WASAPI", ...); `None` searches every host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
        }
    }

    pub fn with_host(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: Some(host.to_string()),
        }
    }

    /// Whether two ids can refer to the same physical output
    ///
    /// An id without a host matches the same name on any host.
    pub fn same_device(&self, other: &DeviceId) -> bool {
        if self.name != other.name {
            return false;
        }
        match (&self.host, &other.host) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Label including the host, e.g. `[ALSA] hw:1,0`
    pub fn display_label(&self) -> String {
        match &self.host {
            Some(host) => format!("[{}] {}", host, self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_label())
    }
}

/// A route's negotiated association with an output
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBinding {
    pub device: DeviceId,
    pub sample_rate: u32,
    /// Negotiated block size in frames
    pub block_size: u32,
    pub channels: u16,
}

impl DeviceBinding {
    /// Duration of one block in milliseconds
    pub fn block_ms(&self) -> f32 {
        self.block_size as f32 / self.sample_rate as f32 * 1000.0
    }
}
