//! Duet Core - dual-output synchronized stem playback
//!
//! Plays an instrumental/vocal stem pair to two output devices at once:
//! the performer's headphones and a stream/capture device. Each route has
//! its own per-stem gain and mute, both share one transposition, and the
//! two stay within a bounded drift of each other.

pub mod analysis;
pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod pitch;
pub mod separation;
pub mod types;

pub use engine::{EngineStatus, PlaybackEngine, RouteConfig, StemGain, TransportState};
pub use error::{ConfigError, EngineError, EngineResult, LoadError, SyncFault};
pub use types::*;
