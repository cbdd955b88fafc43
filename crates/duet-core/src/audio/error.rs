//! Output device error types

use thiserror::Error;

use crate::types::RouteId;

/// Errors raised while enumerating, binding or running output devices
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No audio output devices found")]
    NoDevices,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to get device config: {0}")]
    Config(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlay(String),

    /// Raised once per disconnect; the affected route is paused
    #[error("Output for the {route} route was disconnected")]
    Disconnected { route: RouteId },

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("The {route} route has no output bound")]
    NotBound { route: RouteId },
}

impl DeviceError {
    /// Whether the session survives this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeviceError::Disconnected { .. } | DeviceError::NotBound { .. })
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;
