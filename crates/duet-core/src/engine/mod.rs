//! Playback engine
//!
//! ```text
//!  PlaybackEngine (control thread)
//!     │ load / configure / transport
//!     ├──► Clock ◄──────────────── DriftReconciler (duet-sync thread)
//!     │      ▲  ▲
//!     │      │  └───────────────┐
//!     ├──► RouteRenderer A    RouteRenderer B
//!     │    (device callback)  (device callback)
//!     └──► RouteSnapshot A/B through SharedCell
//! ```
//!
//! Both renderers read the same immutable session audio. Neither waits on
//! the other: the clock is the only state they share and it is all
//! atomics.

mod clock;
#[allow(clippy::module_inception)]
mod engine;
mod gc;
mod mix_bus;
mod renderer;
mod route;
mod sim;
mod sync;

pub use clock::{Clock, CursorSample, TransportState};
pub use engine::{EngineStatus, PlaybackEngine, RouteStatus, SessionInfo, StemInfo};
pub use gc::gc_handle;
pub use mix_bus::{mix_into, MixStats, FULL_SCALE};
pub use renderer::{
    command_channel, RendererCommand, RendererContext, RouteMonitor, RouteRenderer,
    COMMAND_QUEUE_CAPACITY,
};
pub use route::{RouteConfig, RouteSnapshot, StemGain, MAX_STEM_GAIN_DB};
pub use sync::{DriftReconciler, SyncMonitor, SyncReport, SyncThread, MAX_EXTRAPOLATION_NANOS};
pub use sim::{SimulatedDevice, SimulatedOutput};
