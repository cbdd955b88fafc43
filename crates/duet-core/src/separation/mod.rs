//! Vocal separation boundary
//!
//! The engine never separates audio itself. A [`SeparationService`] turns
//! one mixed file into an instrumental/vocal pair on disk, which is then
//! handed to [`crate::engine::PlaybackEngine::load_session`]. Separation
//! takes anywhere from seconds to many minutes, so it runs as a
//! [`SeparationTask`] on its own thread:
//!
//! ```text
//! ┌─────────────┐   cancel flag    ┌────────────────────┐
//! │   caller    │ ───────────────► │  SeparationTask    │
//! │             │ ◄─────────────── │  (background)      │
//! └─────────────┘  progress/result └─────────┬──────────┘
//!                                            ▼
//!                                   SeparationService
//!                                   (e.g. SidecarSeparator)
//! ```

mod sidecar;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, TryRecvError};
use thiserror::Error;

pub use sidecar::{overall_fraction, SidecarEvent, SidecarSeparator};

/// Errors from a separation run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeparationError {
    #[error("Separation cancelled")]
    Cancelled,

    #[error("Separation failed: {0}")]
    Failed(String),

    #[error("Separation did not produce {path}")]
    MissingOutput { path: PathBuf },
}

/// The two files a separation produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemPaths {
    pub instrumental: PathBuf,
    pub vocal: PathBuf,
}

impl StemPaths {
    /// Fail with `MissingOutput` unless both files exist
    pub fn verify(self) -> Result<Self, SeparationError> {
        for path in [&self.instrumental, &self.vocal] {
            if !path.is_file() {
                return Err(SeparationError::MissingOutput { path: path.clone() });
            }
        }
        Ok(self)
    }
}

/// Progress of a running separation
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationProgress {
    /// Human-readable stage name as reported by the service
    pub stage: String,
    /// Overall completion (0.0 - 1.0)
    pub fraction: f32,
}

/// Something that splits a mixed track into instrumental and vocal stems
pub trait SeparationService: Send + Sync {
    /// Separate `input` with model `model_id`
    ///
    /// Implementations should check `cancel` regularly and return
    /// [`SeparationError::Cancelled`] once it is set.
    fn separate(
        &self,
        input: &Path,
        model_id: &str,
        progress: &dyn Fn(SeparationProgress),
        cancel: &AtomicBool,
    ) -> Result<StemPaths, SeparationError>;
}

/// Messages from a task's worker thread
#[derive(Debug, Clone, PartialEq)]
pub enum SeparationEvent {
    Progress(SeparationProgress),
    Finished(Result<StemPaths, SeparationError>),
}

/// A separation running on a background thread
pub struct SeparationTask {
    cancel: Arc<AtomicBool>,
    events: Receiver<SeparationEvent>,
    handle: Option<JoinHandle<()>>,
    latest: Option<SeparationProgress>,
    result: Option<Result<StemPaths, SeparationError>>,
}

impl SeparationTask {
    /// Start separating `input` on a new thread
    pub fn spawn(
        service: Arc<dyn SeparationService>,
        input: PathBuf,
        model_id: String,
    ) -> std::io::Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = channel::unbounded();
        let worker_cancel = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("duet-separation".to_string())
            .spawn(move || {
                log::info!("Separating {:?} with model {}", input, model_id);
                let progress_tx = tx.clone();
                let report = move |p: SeparationProgress| {
                    let _ = progress_tx.send(SeparationEvent::Progress(p));
                };

                let result = service
                    .separate(&input, &model_id, &report, &worker_cancel)
                    .and_then(StemPaths::verify);
                let result = match result {
                    Err(_) if worker_cancel.load(Ordering::Acquire) => {
                        Err(SeparationError::Cancelled)
                    }
                    other => other,
                };

                match &result {
                    Ok(paths) => log::info!(
                        "Separation finished: {:?} + {:?}",
                        paths.instrumental,
                        paths.vocal
                    ),
                    Err(SeparationError::Cancelled) => log::info!("Separation cancelled"),
                    Err(e) => log::warn!("{}", e),
                }
                let _ = tx.send(SeparationEvent::Finished(result));
            })?;

        Ok(Self {
            cancel,
            events: rx,
            handle: Some(handle),
            latest: None,
            result: None,
        })
    }

    /// Ask the service to stop; the task still finishes with `Cancelled`
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Most recent progress seen by [`Self::poll`]
    pub fn progress(&self) -> Option<&SeparationProgress> {
        self.latest.as_ref()
    }

    /// Drain pending events without blocking
    ///
    /// Returns the result once the worker has finished.
    pub fn poll(&mut self) -> Option<&Result<StemPaths, SeparationError>> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.result.is_none() {
                        self.result = Some(Err(SeparationError::Failed(
                            "separation worker exited without a result".to_string(),
                        )));
                    }
                    break;
                }
            }
        }
        self.result.as_ref()
    }

    /// Block until the separation finishes
    pub fn wait(mut self) -> Result<StemPaths, SeparationError> {
        while self.result.is_none() {
            match self.events.recv() {
                Ok(event) => self.apply(event),
                Err(_) => {
                    self.result = Some(Err(SeparationError::Failed(
                        "separation worker exited without a result".to_string(),
                    )));
                }
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.result
            .take()
            .unwrap_or(Err(SeparationError::Cancelled))
    }

    fn apply(&mut self, event: SeparationEvent) {
        match event {
            SeparationEvent::Progress(p) => self.latest = Some(p),
            SeparationEvent::Finished(result) => self.result = Some(result),
        }
    }
}

impl Drop for SeparationTask {
    fn drop(&mut self) {
        // Detach rather than block; the worker exits on its own once it
        // notices the flag
        if self.result.is_none() {
            self.cancel();
        }
    }
}
