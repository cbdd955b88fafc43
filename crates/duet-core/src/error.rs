//! Engine error taxonomy
//!
//! Control-surface operations return [`EngineError`], which wraps the
//! narrower error kinds produced by each subsystem. The render callbacks
//! never produce these directly; they raise atomic flags that the control
//! thread turns into errors when it polls.

use std::path::PathBuf;

use thiserror::Error;

use crate::audio::DeviceError;
use crate::codec::DecodeError;
use crate::types::{RouteId, StemRole};

/// Errors raised while loading a stem pair into a session
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Stem file not found: {path}")]
    MissingFile { path: PathBuf },

    #[error("Failed to decode {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("Unsupported channel count {channels} in {path}")]
    UnsupportedChannels { path: PathBuf, channels: u16 },

    #[error("Failed to resample {path}: {reason}")]
    Resample { path: PathBuf, reason: String },

    #[error("Stem contains no audio: {path}")]
    Empty { path: PathBuf },
}

impl LoadError {
    /// Path of the stem the error originated from
    pub fn path(&self) -> &std::path::Path {
        match self {
            LoadError::MissingFile { path }
            | LoadError::Decode { path, .. }
            | LoadError::UnsupportedChannels { path, .. }
            | LoadError::Resample { path, .. }
            | LoadError::Empty { path } => path,
        }
    }
}

impl From<DecodeError> for LoadError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::NotFound { path } => LoadError::MissingFile { path },
            other => LoadError::Decode {
                path: other.path().to_path_buf(),
                source: other,
            },
        }
    }
}

/// Invalid route or engine configuration
///
/// Only values with no safe substitute are rejected; finite out-of-range
/// values are clamped by the validators and never reach this type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid gain for {stem} stem: {value}")]
    InvalidGain { stem: StemRole, value: f32 },

    #[error("Invalid pitch shift: {0} semitones")]
    InvalidPitch(f32),

    #[error("Invalid target loudness: {0} LUFS")]
    InvalidTargetLufs(f32),

    #[error("No session loaded")]
    NoSession,
}

/// Drift reconciliation failed to converge
///
/// Non-fatal: surfaced through the engine status as a warning.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Route drift of {drift_ms:.1}ms persisted for {ticks} reconciliation ticks")]
pub struct SyncFault {
    pub drift_ms: f32,
    pub ticks: u32,
}

/// Top-level error for playback engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sync(#[from] SyncFault),

    #[error("Route {0} is not bound to an output")]
    RouteNotBound(RouteId),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_decode_error_becomes_missing_file() {
        let err: LoadError = DecodeError::NotFound {
            path: PathBuf::from("/tmp/nope.wav"),
        }
        .into();
        assert!(matches!(err, LoadError::MissingFile { .. }));
        assert_eq!(err.path(), std::path::Path::new("/tmp/nope.wav"));
    }

    #[test]
    fn test_decode_error_keeps_originating_path() {
        let err: LoadError = DecodeError::Unsupported {
            path: PathBuf::from("song.xyz"),
            reason: "unknown container".to_string(),
        }
        .into();
        assert!(matches!(err, LoadError::Decode { .. }));
        assert_eq!(err.path(), std::path::Path::new("song.xyz"));
        assert!(err.to_string().contains("song.xyz"));
    }

    #[test]
    fn test_sync_fault_message() {
        let fault = SyncFault {
            drift_ms: 31.25,
            ticks: 40,
        };
        let msg = fault.to_string();
        assert!(msg.contains("31.2") || msg.contains("31.3"));
        assert!(msg.contains("40"));
    }
}
