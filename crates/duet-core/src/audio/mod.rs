//! Output devices
//!
//! Device enumeration, stream negotiation and the CPAL streams that drive
//! route renderers. With the `jack` feature CPAL's JACK host is available
//! on Linux and shows up in enumeration like any other host.
//!
//! ```ignore
//! use duet_core::audio::{list_output_devices, DeviceId};
//!
//! for device in list_output_devices()? {
//!     println!("{}", device);
//! }
//! engine.bind_route(RouteId::B, Some(DeviceId::with_host("hw:1,0", "ALSA")))?;
//! ```

mod config;
mod cpal_backend;
mod device;
mod error;

pub use config::{
    BufferSize, DeviceBinding, DeviceId, DEFAULT_BLOCK_SIZE, LOW_LATENCY_BLOCK_SIZE,
    MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use cpal_backend::{plan_stream, start_stream, RouteStream, StreamPlan};
pub use device::{default_device, find_device, list_output_devices, OutputDevice};
pub use error::{DeviceError, DeviceResult};
