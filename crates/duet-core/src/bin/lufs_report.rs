//! Print integrated loudness and the suggested trim for audio files
//!
//! ```text
//! lufs-report [--target LUFS] <FILE>...
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use duet_core::analysis::integrated_lufs;
use duet_core::codec::{CodecService, FileCodec};
use duet_core::config::{LoudnessConfig, MAX_TARGET_LUFS, MIN_TARGET_LUFS};
use duet_core::loader::to_stereo;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let mut loudness = LoudnessConfig::default();
    let mut files = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--target" => {
                let target: f32 = args
                    .next()
                    .context("--target expects a value")?
                    .parse()
                    .context("--target expects a number")?;
                if !(MIN_TARGET_LUFS..=MAX_TARGET_LUFS).contains(&target) {
                    bail!(
                        "--target must be between {} and {} LUFS",
                        MIN_TARGET_LUFS,
                        MAX_TARGET_LUFS
                    );
                }
                loudness.target_lufs = target;
            }
            flag if flag.starts_with("--") => bail!("Unknown option {}", flag),
            _ => files.push(PathBuf::from(arg)),
        }
    }
    if files.is_empty() {
        bail!("usage: lufs-report [--target LUFS] <FILE>...");
    }

    let codec = FileCodec::new();
    let mut failed = 0;
    for path in &files {
        let audio = match codec.decode(path) {
            Ok(audio) => audio,
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                failed += 1;
                continue;
            }
        };
        let Some(stereo) = to_stereo(&audio.samples, audio.channels) else {
            eprintln!("{}: unsupported channel count {}", path.display(), audio.channels);
            failed += 1;
            continue;
        };

        let lufs = integrated_lufs(&stereo, audio.sample_rate);
        let trim = loudness.default_trim_db(lufs);
        match lufs {
            Some(lufs) => println!(
                "{:>7.1} LUFS  trim {:+5.1} dB  {:6.1}s  {}",
                lufs,
                trim,
                audio.duration_secs(),
                path.display()
            ),
            None => println!(
                "{:>12}  trim {:+5.1} dB  {:6.1}s  {}",
                "silent",
                trim,
                audio.duration_secs(),
                path.display()
            ),
        }
    }

    if failed > 0 {
        bail!("{} of {} files could not be measured", failed, files.len());
    }
    Ok(())
}
