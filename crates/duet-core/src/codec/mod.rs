//! Codec service boundary
//!
//! The engine only needs decoded interleaved `f32` frames with their rate
//! and channel count. [`CodecService`] is the seam: the default
//! [`FileCodec`] reads WAV/FLAC/MP3 through symphonia and writes WAV and
//! FLAC, while tests substitute in-memory implementations.

mod error;
mod file;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use error::{DecodeError, DecodeResult, EncodeError, EncodeResult};
pub use file::FileCodec;

/// Container formats known to the codec boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Flac,
    Mp3,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
        }
    }

    /// Guess the format from a file extension (case-insensitive)
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "wav" | "wave" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            "mp3" => Some(AudioFormat::Mp3),
            _ => None,
        }
    }

    /// Whether sample values survive an encode/decode cycle unchanged
    pub fn is_lossless(&self) -> bool {
        !matches!(self, AudioFormat::Mp3)
    }
}

/// Decoded audio: interleaved frames plus their layout
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples, `frames() * channels` long
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }
}

/// Decode and encode audio files
///
/// Implementations must be shareable across the loader's worker threads.
pub trait CodecService: Send + Sync {
    /// Decode a whole file into memory
    fn decode(&self, path: &Path) -> DecodeResult<DecodedAudio>;

    /// Encode audio to `path` in `format`, returning the written path
    fn encode(&self, audio: &DecodedAudio, path: &Path, format: AudioFormat)
        -> EncodeResult<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(AudioFormat::from_path(Path::new("a/b.WAV")), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::from_path(Path::new("song.flac")), Some(AudioFormat::Flac));
        assert_eq!(AudioFormat::from_path(Path::new("song.mp3")), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::from_path(Path::new("song.ogg")), None);
        assert_eq!(AudioFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn test_decoded_frames() {
        let audio = DecodedAudio::new(vec![0.0; 88200], 44100, 2);
        assert_eq!(audio.frames(), 44100);
        assert!((audio.duration_secs() - 1.0).abs() < 1e-9);
        assert_eq!(DecodedAudio::new(vec![0.0; 4], 44100, 0).frames(), 0);
    }
}
