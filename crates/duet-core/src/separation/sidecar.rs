//! Separation through an external sidecar process
//!
//! The sidecar receives one JSON job on stdin and answers with
//! newline-delimited JSON events on stdout:
//!
//! ```text
//! → {"cmd":"separate","input":"/music/song.mp3","model":"UVR-MDX-NET-Inst_HQ_5.onnx","output_dir":"/tmp/out"}
//! ← {"type":"progress","stage":"LoadingModel","pct":40}
//! ← {"type":"progress","stage":"Separation","pct":100}
//! ← {"type":"done","files":["/tmp/out/song_(Instrumental).wav","/tmp/out/song_(Vocals).wav"]}
//! ```
//!
//! A `{"type":"error","msg":...}` event fails the job. Cancelling kills the
//! process.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use super::{SeparationError, SeparationProgress, SeparationService, StemPaths};

/// How often a running job checks its cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Weight of each sidecar stage in overall progress, in order
const STAGE_WEIGHTS: [(&str, f32); 4] = [
    ("DownloadingModel", 10.0),
    ("LoadingModel", 15.0),
    ("Separation", 65.0),
    ("Finalize", 5.0),
];

/// Overall completion (0.0 - 1.0) from a stage and its percentage
///
/// Earlier stages count as complete. Unknown stages report 0.
pub fn overall_fraction(stage: &str, pct: f32) -> f32 {
    let mut total = 0.0;
    for (name, weight) in STAGE_WEIGHTS {
        if name == stage {
            total += weight * pct.clamp(0.0, 100.0) / 100.0;
            return (total / 100.0).clamp(0.0, 1.0);
        }
        total += weight;
    }
    0.0
}

#[derive(Debug, Serialize)]
struct SidecarJob<'a> {
    cmd: &'static str,
    input: &'a Path,
    model: &'a str,
    output_dir: &'a Path,
}

/// One line of sidecar output
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SidecarEvent {
    Progress {
        #[serde(default)]
        stage: String,
        #[serde(default)]
        pct: f32,
    },
    Done {
        files: Vec<PathBuf>,
    },
    Error {
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Other,
}

impl SidecarEvent {
    /// Parse one stdout line; anything that isn't an event is `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Pick the instrumental and vocal files out of a sidecar's output list
fn classify_outputs(files: &[PathBuf]) -> Result<StemPaths, SeparationError> {
    let name = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    };
    let instrumental = files.iter().find(|p| {
        let n = name(p);
        n.contains("instrumental") || n.contains("_inst") || n.contains("(inst")
    });
    let vocal = files.iter().find(|p| name(p).contains("vocal"));

    match (instrumental, vocal) {
        (Some(i), Some(v)) => Ok(StemPaths {
            instrumental: i.clone(),
            vocal: v.clone(),
        }),
        _ => Err(SeparationError::Failed(format!(
            "could not identify instrumental and vocal stems in {:?}",
            files
        ))),
    }
}

/// Runs separation jobs in an external process
#[derive(Debug, Clone)]
pub struct SidecarSeparator {
    program: PathBuf,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl SidecarSeparator {
    /// `program args...` is started once per job
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn spawn(&self) -> Result<Child, SeparationError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                SeparationError::Failed(format!("failed to start {:?}: {}", self.program, e))
            })
    }
}

impl SeparationService for SidecarSeparator {
    fn separate(
        &self,
        input: &Path,
        model_id: &str,
        progress: &dyn Fn(SeparationProgress),
        cancel: &AtomicBool,
    ) -> Result<StemPaths, SeparationError> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            SeparationError::Failed(format!("cannot create {:?}: {}", self.output_dir, e))
        })?;

        let mut child = self.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let job = SidecarJob {
                cmd: "separate",
                input,
                model: model_id,
                output_dir: &self.output_dir,
            };
            let written = serde_json::to_string(&job)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(stdin, "{}", line));
            if let Err(e) = written {
                log::debug!("Sidecar did not accept the job on stdin: {}", e);
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SeparationError::Failed("sidecar stdout unavailable".to_string()))?;
        let (line_tx, line_rx) = channel::unbounded();
        let reader = thread::Builder::new()
            .name("duet-sidecar-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| SeparationError::Failed(e.to_string()))?;

        let result = loop {
            if cancel.load(Ordering::Acquire) {
                let _ = child.kill();
                break Err(SeparationError::Cancelled);
            }
            match line_rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => match SidecarEvent::parse(&line) {
                    Some(SidecarEvent::Progress { stage, pct }) => progress(SeparationProgress {
                        fraction: overall_fraction(&stage, pct),
                        stage,
                    }),
                    Some(SidecarEvent::Done { files }) => break classify_outputs(&files),
                    Some(SidecarEvent::Error { msg }) => break Err(SeparationError::Failed(msg)),
                    Some(SidecarEvent::Other) => {}
                    None => log::debug!("sidecar: {}", line),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(SeparationError::Failed(
                        "sidecar exited without a result".to_string(),
                    ))
                }
            }
        };

        match child.wait() {
            Ok(status) if !status.success() && result.is_ok() => {
                log::warn!("Sidecar reported success but exited with {}", status);
            }
            Err(e) => log::warn!("Failed to reap sidecar: {}", e),
            _ => {}
        }
        // A killed sidecar may leave grandchildren holding stdout open
        if result != Err(SeparationError::Cancelled) {
            let _ = reader.join();
        }
        result
    }
}
