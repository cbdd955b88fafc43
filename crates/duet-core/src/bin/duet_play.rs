//! Headless dual-output player
//!
//! Loads an instrumental/vocal pair, binds the headphones and stream routes
//! and plays for a while, printing the engine status once a second.
//!
//! ```text
//! duet-play [OPTIONS] <INSTRUMENTAL> <VOCAL>
//!
//!   --list-devices          List output devices and exit
//!   --config <PATH>         Engine config (default: ~/.config/duet/engine.yaml)
//!   --headphones <DEVICE>   Route A device, `NAME` or `NAME@HOST` (default: config, then system default)
//!   --stream <DEVICE>       Route B device (unbound unless given here or in the config)
//!   --pitch <SEMITONES>     Transposition for both routes
//!   --seconds <N>           Stop after N seconds (default: whole session)
//!   --start <SECONDS>       Seek before starting
//! ```

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use duet_core::audio::{list_output_devices, DeviceId};
use duet_core::config::{default_config_path, load_config, load_config_strict, EngineConfig};
use duet_core::engine::{EngineStatus, PlaybackEngine};
use duet_core::loader::LoadProgress;
use duet_core::RouteId;

#[derive(Debug, Default)]
struct Args {
    list_devices: bool,
    config: Option<PathBuf>,
    headphones: Option<DeviceId>,
    stream: Option<DeviceId>,
    pitch: Option<f32>,
    seconds: Option<f64>,
    start: Option<f64>,
    stems: Vec<PathBuf>,
}

/// `NAME@HOST` or just `NAME`
fn parse_device(spec: &str) -> DeviceId {
    match spec.rsplit_once('@') {
        Some((name, host)) if !name.is_empty() && !host.is_empty() => {
            DeviceId::with_host(name, host)
        }
        _ => DeviceId::new(spec),
    }
}

/// Device for a route: the command line wins over the config file
fn route_device(cli: Option<DeviceId>, engine: &PlaybackEngine, route: RouteId) -> Option<DeviceId> {
    cli.or_else(|| engine.route_config(route).device.clone())
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .with_context(|| format!("{} expects a value", flag))
        };
        match arg.as_str() {
            "--list-devices" => args.list_devices = true,
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--headphones" => args.headphones = Some(parse_device(&value("--headphones")?)),
            "--stream" => args.stream = Some(parse_device(&value("--stream")?)),
            "--pitch" => {
                args.pitch = Some(value("--pitch")?.parse().context("--pitch expects a number")?)
            }
            "--seconds" => {
                args.seconds = Some(
                    value("--seconds")?
                        .parse()
                        .context("--seconds expects a number")?,
                )
            }
            "--start" => {
                args.start = Some(value("--start")?.parse().context("--start expects a number")?)
            }
            "-h" | "--help" => {
                println!("usage: duet-play [--list-devices] [--config PATH] [--headphones DEVICE] [--stream DEVICE] [--pitch N] [--seconds N] [--start SECONDS] INSTRUMENTAL VOCAL");
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("Unknown option {}", flag),
            _ => args.stems.push(PathBuf::from(arg)),
        }
    }
    Ok(args)
}

fn print_devices() -> Result<()> {
    let devices = list_output_devices()?;
    for device in devices {
        let rates: Vec<String> = device.sample_rates.iter().map(|r| r.to_string()).collect();
        println!(
            "{}  ({} ch, {} Hz)  --headphones '{}@{}'",
            device,
            device.max_channels,
            rates.join("/"),
            device.name,
            device.host
        );
    }
    Ok(())
}

fn print_status(status: &EngineStatus) {
    let drift = status
        .drift_ms
        .map(|d| format!("{:+.2}ms", d))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:>8} {:7.2}/{:.2}s  drift {}",
        status.state.name(),
        status.position_secs,
        status.duration_secs,
        drift
    );
    for route in &status.routes {
        if route.binding.is_none() && !route.shared_device {
            continue;
        }
        let mut flags = String::new();
        if route.shared_device {
            flags.push_str(" shared");
        }
        if route.disconnected {
            flags.push_str(" DISCONNECTED");
        }
        if route.nudged {
            flags.push_str(" nudged");
        }
        line.push_str(&format!(
            "  | {} L{:.2} R{:.2} clip {}{}",
            route.route, route.levels[0], route.levels[1], route.clipped_samples, flags
        ));
    }
    if let Some(warning) = status.sync_warning {
        line.push_str(&format!("  ! {}", warning));
    }
    println!("{}", line);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    if args.list_devices {
        return print_devices();
    }
    let [instrumental, vocal] = args.stems.as_slice() else {
        bail!("Expected an instrumental and a vocal stem (see --help)");
    };

    let config: EngineConfig = match &args.config {
        Some(path) => load_config_strict(path)?,
        None => load_config(&default_config_path()),
    };

    let mut engine = PlaybackEngine::with_file_codec(config);
    let info = engine.load_session_with_progress(instrumental, vocal, |p: LoadProgress| {
        log::debug!("{} {:.0}%", p.stage.description(), p.fraction * 100.0);
    })?;
    for stem in &info.stems {
        match stem.lufs {
            Some(lufs) => println!("{}: {:.1} LUFS", stem.role, lufs),
            None => println!("{}: silent", stem.role),
        }
    }

    if let Some(pitch) = args.pitch {
        engine.set_pitch(pitch)?;
    }

    let headphones = route_device(args.headphones.clone(), &engine, RouteId::A);
    let stream = route_device(args.stream.clone(), &engine, RouteId::B);

    let binding = engine.bind_route(RouteId::A, headphones)?;
    println!("{} -> {}", RouteId::A, binding.device);
    if let Some(device) = stream {
        let binding = engine.bind_route(RouteId::B, Some(device))?;
        println!("{} -> {}", RouteId::B, binding.device);
    }

    if let Some(start) = args.start {
        engine.seek(start);
    }
    engine.play()?;

    let limit = args
        .seconds
        .map(Duration::from_secs_f64)
        .unwrap_or_else(|| Duration::from_secs_f64(info.duration_secs + 1.0));
    let started = Instant::now();

    while started.elapsed() < limit {
        thread::sleep(Duration::from_secs(1));
        for fault in engine.poll_faults() {
            eprintln!("warning: {}", fault);
        }
        let status = engine.status();
        print_status(&status);
        if status.ended {
            break;
        }
    }

    engine.teardown();
    Ok(())
}
