//! Session loading
//!
//! Turns a pair of stem files into a [`SessionAudio`] ready for playback:
//!
//! 1. Decode both stems in parallel through the [`CodecService`]
//! 2. Normalize layout to stereo (mono is duplicated, extra channels dropped)
//! 3. Replace non-finite samples with silence
//! 4. Resample to the session rate
//! 5. Measure integrated loudness of each stem
//!
//! Everything here runs off the audio threads. Renderers only ever see a
//! finished session.

mod resample;

use std::path::{Path, PathBuf};

pub use resample::{resample_stereo, resampled_len};

use crate::analysis::measure_stems;
use crate::codec::CodecService;
use crate::error::LoadError;
use crate::types::{StemRole, StereoSample, NUM_STEMS};

/// Loading phase, reported through the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Decoding,
    Resampling,
    Analyzing,
    Ready,
}

impl LoadStage {
    pub fn description(&self) -> &'static str {
        match self {
            LoadStage::Decoding => "Decoding stems",
            LoadStage::Resampling => "Resampling",
            LoadStage::Analyzing => "Measuring loudness",
            LoadStage::Ready => "Ready",
        }
    }
}

/// Progress update for a running load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadProgress {
    pub stage: LoadStage,
    /// Overall completion from 0.0 to 1.0
    pub fraction: f32,
}

impl LoadProgress {
    fn new(stage: LoadStage, fraction: f32) -> Self {
        Self { stage, fraction }
    }
}

/// Options that shape a loaded session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadOptions {
    /// Session rate; `None` adopts the instrumental stem's rate
    pub reference_sample_rate: Option<u32>,
}

/// One decoded, normalized stem
#[derive(Debug, Clone)]
pub struct StemBuffer {
    pub role: StemRole,
    pub path: PathBuf,
    /// Stereo frames at the session rate
    pub samples: Vec<StereoSample>,
    pub source_sample_rate: u32,
    pub source_channels: u16,
    /// Integrated loudness; `None` when the stem is effectively silent
    pub lufs: Option<f32>,
}

impl StemBuffer {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A loaded stem pair sharing one sample rate
///
/// Immutable once built. Route renderers read it concurrently through a
/// `basedrop::Shared` handle.
#[derive(Debug, Clone)]
pub struct SessionAudio {
    pub sample_rate: u32,
    pub stems: [StemBuffer; NUM_STEMS],
    length: usize,
}

impl SessionAudio {
    /// Build a session from already-decoded stereo stems
    pub fn from_stems(
        sample_rate: u32,
        instrumental: Vec<StereoSample>,
        vocal: Vec<StereoSample>,
    ) -> Self {
        let stem = |role: StemRole, samples: Vec<StereoSample>| StemBuffer {
            role,
            path: PathBuf::new(),
            samples,
            source_sample_rate: sample_rate,
            source_channels: 2,
            lufs: None,
        };
        Self::new(
            sample_rate,
            [
                stem(StemRole::Instrumental, instrumental),
                stem(StemRole::Vocal, vocal),
            ],
        )
    }

    fn new(sample_rate: u32, stems: [StemBuffer; NUM_STEMS]) -> Self {
        let length = stems.iter().map(StemBuffer::len).min().unwrap_or(0);
        Self {
            sample_rate,
            stems,
            length,
        }
    }

    /// Playable length in frames: the shorter of the two stems
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn duration_secs(&self) -> f64 {
        self.length as f64 / self.sample_rate.max(1) as f64
    }

    pub fn stem(&self, role: StemRole) -> &StemBuffer {
        &self.stems[role.index()]
    }

    pub fn lufs(&self) -> [Option<f32>; NUM_STEMS] {
        [self.stems[0].lufs, self.stems[1].lufs]
    }
}

/// Decoded stem before rate conversion
struct DecodedStem {
    samples: Vec<StereoSample>,
    sample_rate: u32,
    channels: u16,
}

/// Load and prepare a stem pair
///
/// `progress` is called from the calling thread only.
pub fn load_session(
    codec: &dyn CodecService,
    instrumental: &Path,
    vocal: &Path,
    options: &LoadOptions,
    progress: &mut dyn FnMut(LoadProgress),
) -> Result<SessionAudio, LoadError> {
    progress(LoadProgress::new(LoadStage::Decoding, 0.0));
    let (instr, voc) = rayon::join(
        || decode_stem(codec, instrumental),
        || decode_stem(codec, vocal),
    );
    let (instr, voc) = (instr?, voc?);

    let session_rate = options
        .reference_sample_rate
        .unwrap_or(instr.sample_rate);
    log::info!(
        "Decoded stems: instrumental {} frames @ {}Hz ({}ch), vocal {} frames @ {}Hz ({}ch); session rate {}Hz",
        instr.samples.len(),
        instr.sample_rate,
        instr.channels,
        voc.samples.len(),
        voc.sample_rate,
        voc.channels,
        session_rate
    );

    progress(LoadProgress::new(LoadStage::Resampling, 0.4));
    let (instr_samples, voc_samples) = rayon::join(
        || convert_rate(&instr, session_rate, instrumental),
        || convert_rate(&voc, session_rate, vocal),
    );
    let (instr_samples, voc_samples) = (instr_samples?, voc_samples?);

    if instr_samples.len() != voc_samples.len() {
        log::warn!(
            "Stem lengths differ ({} vs {} frames); playback ends with the shorter",
            instr_samples.len(),
            voc_samples.len()
        );
    }

    progress(LoadProgress::new(LoadStage::Analyzing, 0.7));
    let lufs = measure_stems([&instr_samples[..], &voc_samples[..]], session_rate);
    log::info!(
        "Stem loudness: instrumental {}, vocal {}",
        format_lufs(lufs[0]),
        format_lufs(lufs[1])
    );

    let stems = [
        StemBuffer {
            role: StemRole::Instrumental,
            path: instrumental.to_path_buf(),
            samples: instr_samples,
            source_sample_rate: instr.sample_rate,
            source_channels: instr.channels,
            lufs: lufs[0],
        },
        StemBuffer {
            role: StemRole::Vocal,
            path: vocal.to_path_buf(),
            samples: voc_samples,
            source_sample_rate: voc.sample_rate,
            source_channels: voc.channels,
            lufs: lufs[1],
        },
    ];

    progress(LoadProgress::new(LoadStage::Ready, 1.0));
    Ok(SessionAudio::new(session_rate, stems))
}

fn format_lufs(lufs: Option<f32>) -> String {
    match lufs {
        Some(value) => format!("{:.1} LUFS", value),
        None => "silent".to_string(),
    }
}

fn decode_stem(codec: &dyn CodecService, path: &Path) -> Result<DecodedStem, LoadError> {
    let decoded = codec.decode(path)?;

    let mut samples = to_stereo(&decoded.samples, decoded.channels).ok_or_else(|| {
        LoadError::UnsupportedChannels {
            path: path.to_path_buf(),
            channels: decoded.channels,
        }
    })?;

    let replaced = sanitize(&mut samples);
    if replaced > 0 {
        log::warn!(
            "Replaced {} non-finite samples with silence in {:?}",
            replaced,
            path
        );
    }

    if samples.is_empty() || decoded.sample_rate == 0 {
        return Err(LoadError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(DecodedStem {
        samples,
        sample_rate: decoded.sample_rate,
        channels: decoded.channels,
    })
}

fn convert_rate(
    stem: &DecodedStem,
    session_rate: u32,
    path: &Path,
) -> Result<Vec<StereoSample>, LoadError> {
    if stem.sample_rate == session_rate {
        return Ok(stem.samples.clone());
    }
    log::debug!(
        "Resampling {:?} from {}Hz to {}Hz",
        path,
        stem.sample_rate,
        session_rate
    );
    resample_stereo(&stem.samples, stem.sample_rate, session_rate).map_err(|reason| {
        LoadError::Resample {
            path: path.to_path_buf(),
            reason,
        }
    })
}

/// Convert interleaved audio to stereo frames
///
/// Mono is duplicated to both sides; beyond two channels only the first
/// two are kept. Returns `None` for a zero channel count.
pub fn to_stereo(interleaved: &[f32], channels: u16) -> Option<Vec<StereoSample>> {
    match channels {
        0 => None,
        1 => Some(interleaved.iter().map(|&s| StereoSample::mono(s)).collect()),
        n => Some(
            interleaved
                .chunks_exact(n as usize)
                .map(|frame| StereoSample::new(frame[0], frame[1]))
                .collect(),
        ),
    }
}

/// Replace NaN and infinite samples with silence; returns how many changed
fn sanitize(samples: &mut [StereoSample]) -> usize {
    let mut replaced = 0;
    for sample in samples.iter_mut() {
        if !sample.left.is_finite() {
            sample.left = 0.0;
            replaced += 1;
        }
        if !sample.right.is_finite() {
            sample.right = 0.0;
            replaced += 1;
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioFormat, DecodeError, DecodeResult, DecodedAudio, EncodeResult};
    use std::collections::HashMap;

    /// In-memory codec keyed by file name
    struct MemoryCodec {
        files: HashMap<PathBuf, DecodedAudio>,
    }

    impl MemoryCodec {
        fn new(files: Vec<(&str, DecodedAudio)>) -> Self {
            Self {
                files: files
                    .into_iter()
                    .map(|(name, audio)| (PathBuf::from(name), audio))
                    .collect(),
            }
        }
    }

    impl CodecService for MemoryCodec {
        fn decode(&self, path: &Path) -> DecodeResult<DecodedAudio> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| DecodeError::NotFound {
                    path: path.to_path_buf(),
                })
        }

        fn encode(&self, _: &DecodedAudio, path: &Path, _: AudioFormat) -> EncodeResult<PathBuf> {
            Ok(path.to_path_buf())
        }
    }

    fn tone(rate: u32, channels: u16, frames: usize) -> DecodedAudio {
        let samples = (0..frames)
            .flat_map(|i| {
                let v = 0.1 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin();
                std::iter::repeat(v).take(channels as usize)
            })
            .collect();
        DecodedAudio::new(samples, rate, channels)
    }

    fn load(codec: &MemoryCodec, options: LoadOptions) -> Result<SessionAudio, LoadError> {
        load_session(
            codec,
            Path::new("instr.wav"),
            Path::new("vocal.wav"),
            &options,
            &mut |_| {},
        )
    }

    #[test]
    fn test_mono_and_surround_become_stereo() {
        let codec = MemoryCodec::new(vec![
            ("instr.wav", tone(44100, 1, 44100)),
            ("vocal.wav", tone(44100, 6, 44100)),
        ]);
        let session = load(&codec, LoadOptions::default()).unwrap();

        assert_eq!(session.sample_rate, 44100);
        assert_eq!(session.len(), 44100);
        let instr = session.stem(StemRole::Instrumental);
        assert_eq!(instr.source_channels, 1);
        assert_eq!(instr.samples[100].left, instr.samples[100].right);
        assert_eq!(session.stem(StemRole::Vocal).source_channels, 6);
        assert!(instr.lufs.is_some());
    }

    #[test]
    fn test_vocal_resampled_to_instrumental_rate() {
        let codec = MemoryCodec::new(vec![
            ("instr.wav", tone(44100, 2, 44100)),
            ("vocal.wav", tone(48000, 2, 48000)),
        ]);
        let session = load(&codec, LoadOptions::default()).unwrap();

        assert_eq!(session.sample_rate, 44100);
        let vocal = session.stem(StemRole::Vocal);
        assert_eq!(vocal.len(), 44100);
        assert_eq!(vocal.source_sample_rate, 48000);
    }

    #[test]
    fn test_reference_rate_resamples_both() {
        let codec = MemoryCodec::new(vec![
            ("instr.wav", tone(44100, 2, 22050)),
            ("vocal.wav", tone(44100, 2, 44100)),
        ]);
        let options = LoadOptions {
            reference_sample_rate: Some(48000),
        };
        let session = load(&codec, options).unwrap();

        assert_eq!(session.sample_rate, 48000);
        assert_eq!(session.stem(StemRole::Instrumental).len(), 24000);
        assert_eq!(session.stem(StemRole::Vocal).len(), 48000);
        // Shorter stem bounds playback
        assert_eq!(session.len(), 24000);
    }

    #[test]
    fn test_missing_stem_reported_by_path() {
        let codec = MemoryCodec::new(vec![("instr.wav", tone(44100, 2, 1000))]);
        let err = load(&codec, LoadOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::MissingFile { .. }));
        assert_eq!(err.path(), Path::new("vocal.wav"));
    }

    #[test]
    fn test_zero_channels_rejected() {
        let codec = MemoryCodec::new(vec![
            ("instr.wav", DecodedAudio::new(vec![0.0; 16], 44100, 0)),
            ("vocal.wav", tone(44100, 2, 1000)),
        ]);
        let err = load(&codec, LoadOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::UnsupportedChannels { channels: 0, .. }
        ));
    }

    #[test]
    fn test_empty_stem_rejected() {
        let codec = MemoryCodec::new(vec![
            ("instr.wav", tone(44100, 2, 1000)),
            ("vocal.wav", DecodedAudio::new(Vec::new(), 44100, 2)),
        ]);
        let err = load(&codec, LoadOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::Empty { .. }));
    }

    #[test]
    fn test_non_finite_samples_become_silence() {
        let mut audio = tone(44100, 2, 1000);
        audio.samples[10] = f32::NAN;
        audio.samples[11] = f32::INFINITY;
        let codec = MemoryCodec::new(vec![
            ("instr.wav", audio),
            ("vocal.wav", tone(44100, 2, 1000)),
        ]);
        let session = load(&codec, LoadOptions::default()).unwrap();
        assert_eq!(
            session.stem(StemRole::Instrumental).samples[5],
            StereoSample::silence()
        );
    }

    #[test]
    fn test_progress_reaches_ready() {
        let codec = MemoryCodec::new(vec![
            ("instr.wav", tone(44100, 2, 1000)),
            ("vocal.wav", tone(44100, 2, 1000)),
        ]);
        let mut stages = Vec::new();
        load_session(
            &codec,
            Path::new("instr.wav"),
            Path::new("vocal.wav"),
            &LoadOptions::default(),
            &mut |p| stages.push(p.stage),
        )
        .unwrap();
        assert_eq!(stages.first(), Some(&LoadStage::Decoding));
        assert_eq!(stages.last(), Some(&LoadStage::Ready));
    }
}
