//! File-backed codec: symphonia for decoding, hound and flacenc for encoding

use std::fs::File;
use std::path::{Path, PathBuf};

use flacenc::component::BitRepr;
use flacenc::error::Verify;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::error::{DecodeError, DecodeResult, EncodeError, EncodeResult};
use super::{AudioFormat, CodecService, DecodedAudio};

/// Bit depth used for FLAC output
const FLAC_BITS_PER_SAMPLE: usize = 24;

/// Codec that reads and writes real files
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCodec;

impl FileCodec {
    pub fn new() -> Self {
        Self
    }
}

impl CodecService for FileCodec {
    fn decode(&self, path: &Path) -> DecodeResult<DecodedAudio> {
        decode_file(path)
    }

    fn encode(
        &self,
        audio: &DecodedAudio,
        path: &Path,
        format: AudioFormat,
    ) -> EncodeResult<PathBuf> {
        if audio.channels == 0 || audio.sample_rate == 0 {
            return Err(EncodeError::InvalidInput {
                path: path.to_path_buf(),
                reason: format!(
                    "{} channels at {}Hz",
                    audio.channels, audio.sample_rate
                ),
            });
        }

        match format {
            AudioFormat::Wav => encode_wav(audio, path)?,
            AudioFormat::Flac => encode_flac(audio, path)?,
            AudioFormat::Mp3 => {
                return Err(EncodeError::UnsupportedFormat {
                    format,
                    path: path.to_path_buf(),
                })
            }
        }

        log::info!(
            "Wrote {:.1}s of {:?} audio to {:?}",
            audio.duration_secs(),
            format,
            path
        );
        Ok(path.to_path_buf())
    }
}

/// Decode an entire file to interleaved f32
fn decode_file(path: &Path) -> DecodeResult<DecodedAudio> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DecodeError::NotFound {
            path: path.to_path_buf(),
        },
        _ => DecodeError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Unsupported {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::NoTrack {
            path: path.to_path_buf(),
        })?;
    let track_id = track.id;

    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| DecodeError::Unsupported {
            path: path.to_path_buf(),
            reason: "unknown sample rate".to_string(),
        })?;
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Unsupported {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut bad_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                log::warn!("Stopped reading {:?} early: {}", path, e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                bad_packets += 1;
                log::debug!("Skipping bad packet in {:?}: {}", path, e);
                continue;
            }
            Err(e) => {
                return Err(DecodeError::Corrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels = spec.channels.count() as u16;
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    if bad_packets > 0 {
        log::warn!("Skipped {} undecodable packets in {:?}", bad_packets, path);
        if samples.is_empty() {
            return Err(DecodeError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("all {} packets failed to decode", bad_packets),
            });
        }
    }

    log::debug!(
        "Decoded {:?}: {} frames, {}Hz, {} channels",
        path,
        samples.len() / channels.max(1) as usize,
        sample_rate,
        channels
    );

    Ok(DecodedAudio::new(samples, sample_rate, channels))
}

/// 32-bit float WAV keeps every sample value bit-exact
fn encode_wav(audio: &DecodedAudio, path: &Path) -> EncodeResult<()> {
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let to_encode_error = |e: hound::Error| match e {
        hound::Error::IoError(source) => EncodeError::Io {
            path: path.to_path_buf(),
            source,
        },
        other => EncodeError::Encoder {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(to_encode_error)?;
    for &sample in &audio.samples {
        writer.write_sample(sample).map_err(to_encode_error)?;
    }
    writer.finalize().map_err(to_encode_error)
}

/// FLAC is integer-only; samples are quantized to 24 bits
fn encode_flac(audio: &DecodedAudio, path: &Path) -> EncodeResult<()> {
    let encoder_error = |reason: String| EncodeError::Encoder {
        path: path.to_path_buf(),
        reason,
    };

    let scale = ((1i32 << (FLAC_BITS_PER_SAMPLE - 1)) - 1) as f32;
    let quantized: Vec<i32> = audio
        .samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * scale).round() as i32)
        .collect();

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|(_, e)| encoder_error(format!("{:?}", e)))?;
    let source = flacenc::source::MemSource::from_samples(
        &quantized,
        audio.channels as usize,
        FLAC_BITS_PER_SAMPLE,
        audio.sample_rate as usize,
    );
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| encoder_error(format!("{:?}", e)))?;

    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| encoder_error(format!("{:?}", e)))?;

    std::fs::write(path, sink.as_slice()).map_err(|source| EncodeError::Io {
        path: path.to_path_buf(),
        source,
    })
}
