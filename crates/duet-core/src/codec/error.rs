//! Codec error types

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::AudioFormat;

/// Errors produced while decoding an audio file
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("File not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported audio in {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("No audio track in {path}")]
    NoTrack { path: PathBuf },

    #[error("Corrupt audio in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl DecodeError {
    pub fn path(&self) -> &Path {
        match self {
            DecodeError::NotFound { path }
            | DecodeError::Io { path, .. }
            | DecodeError::Unsupported { path, .. }
            | DecodeError::NoTrack { path }
            | DecodeError::Corrupt { path, .. } => path,
        }
    }
}

/// Errors produced while encoding an audio file
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Encoding {format:?} is not supported ({path})")]
    UnsupportedFormat { format: AudioFormat, path: PathBuf },

    #[error("Invalid audio for {path}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    #[error("Failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder failed for {path}: {reason}")]
    Encoder { path: PathBuf, reason: String },
}

pub type DecodeResult<T> = Result<T, DecodeError>;
pub type EncodeResult<T> = Result<T, EncodeError>;
