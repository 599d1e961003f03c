//! Continuous face scanner.
//!
//! A status state machine (`Idle → Initializing → Ready → Scanning ⇄
//! Detected → Verified/Failed`) driving a periodic detection loop over a
//! [`FrameSource`] and an [`EmbeddingExtractor`].
//!
//! Ticks are single-flight: each extraction is awaited before the next tick
//! is considered, and ticks missed while extracting are skipped rather than
//! queued. Every scan session has a generation number; once `stop()` returns,
//! a result from an extraction that was still in flight is discarded.

use crate::source::{Detection, EmbeddingExtractor, ExtractorError, FrameSource, FrameSourceError};
use crate::types::{BoundingBox, Embedding};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Tick period while actively scanning.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Initializing,
    Ready,
    Scanning,
    Detected,
    Verified,
    Failed,
    Error,
}

impl ScanStatus {
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Ready | Error)
                | (Error, Idle)
                | (Ready, Scanning)
                | (Scanning, Detected)
                | (Detected, Scanning)
                | (Scanning | Detected, Verified | Failed)
                | (Verified | Failed, Scanning)
                | (Scanning | Detected | Verified | Failed, Ready)
        )
    }

    /// A scan loop is running in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ScanStatus::Scanning | ScanStatus::Detected | ScanStatus::Verified | ScanStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Initializing => "initializing",
            ScanStatus::Ready => "ready",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Detected => "detected",
            ScanStatus::Verified => "verified",
            ScanStatus::Failed => "failed",
            ScanStatus::Error => "error",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("invalid scanner transition: {from} -> {to}")]
    InvalidTransition { from: ScanStatus, to: ScanStatus },
    #[error("extractor load failed: {0}")]
    Load(#[source] ExtractorError),
    #[error("scan interval must be greater than zero")]
    ZeroInterval,
    #[error(transparent)]
    FrameSource(#[from] FrameSourceError),
}

/// Outcome of one tick, delivered to the scan sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub detected: bool,
    pub confidence: f32,
    pub embedding: Option<Embedding>,
    pub bounding_box: Option<BoundingBox>,
}

impl DetectionResult {
    /// A tick that found no face.
    pub fn none() -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            embedding: None,
            bounding_box: None,
        }
    }
}

impl From<Detection> for DetectionResult {
    fn from(d: Detection) -> Self {
        Self {
            detected: true,
            confidence: d.score,
            embedding: Some(d.embedding),
            bounding_box: Some(d.bounding_box),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScannerConfig {
    pub interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

pub struct Scanner {
    source: Arc<dyn FrameSource>,
    extractor: Arc<dyn EmbeddingExtractor>,
    config: ScannerConfig,
    status: Arc<watch::Sender<ScanStatus>>,
    /// Current scan session. Held while a tick result is delivered.
    generation: Arc<Mutex<u64>>,
    task: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn FrameSource>,
        extractor: Arc<dyn EmbeddingExtractor>,
        config: ScannerConfig,
    ) -> Self {
        let (status, _) = watch::channel(ScanStatus::Idle);
        Self {
            source,
            extractor,
            config,
            status: Arc::new(status),
            generation: Arc::new(Mutex::new(0)),
            task: None,
        }
    }

    pub fn status(&self) -> ScanStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Load the extractor model. A no-op once loaded.
    ///
    /// On failure the scanner enters `Error` and stays there until `reset()`.
    pub async fn load(&self, model_location: &str) -> Result<(), ScannerError> {
        let current = self.status();
        if current == ScanStatus::Ready || current.is_active() {
            tracing::debug!(status = %current, "extractor already loaded");
            return Ok(());
        }
        transition(&self.status, ScanStatus::Initializing)?;

        let extractor = Arc::clone(&self.extractor);
        let location = model_location.to_string();
        let loaded = tokio::task::spawn_blocking(move || extractor.load(&location))
            .await
            .unwrap_or_else(|e| Err(ExtractorError::LoadFailed(format!("load task failed: {e}"))));

        match loaded {
            Ok(()) => {
                tracing::info!(model = model_location, "extractor loaded");
                transition(&self.status, ScanStatus::Ready)
            }
            Err(e) => {
                tracing::error!(model = model_location, error = %e, "extractor load failed");
                transition(&self.status, ScanStatus::Error)?;
                Err(ScannerError::Load(e))
            }
        }
    }

    /// Leave `Error` so that `load` can be retried.
    pub fn reset(&self) -> Result<(), ScannerError> {
        transition(&self.status, ScanStatus::Idle)
    }

    /// Start the periodic scan loop, delivering every tick result to `sink`.
    ///
    /// Starts the frame source first; if that fails the scanner stays
    /// `Ready`. A zero interval is rejected the same way. Must be called
    /// from within a Tokio runtime.
    pub fn start<F>(&mut self, sink: F) -> Result<(), ScannerError>
    where
        F: FnMut(DetectionResult) + Send + 'static,
    {
        let current = self.status();
        if current != ScanStatus::Ready {
            return Err(ScannerError::InvalidTransition {
                from: current,
                to: ScanStatus::Scanning,
            });
        }
        if self.config.interval.is_zero() {
            return Err(ScannerError::ZeroInterval);
        }

        if let Err(e) = self.source.start() {
            tracing::warn!(error = %e, "frame source failed to start");
            return Err(e.into());
        }

        let session = {
            let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
            *generation += 1;
            *generation
        };
        transition(&self.status, ScanStatus::Scanning)?;

        tracing::info!(
            session,
            interval_ms = self.config.interval.as_millis() as u64,
            "scan started"
        );

        self.task = Some(tokio::spawn(scan_loop(
            Arc::clone(&self.source),
            Arc::clone(&self.extractor),
            self.config.interval,
            Arc::clone(&self.status),
            Arc::clone(&self.generation),
            session,
            sink,
        )));
        Ok(())
    }

    /// Stop scanning. Future ticks are cancelled and a result still in
    /// flight is discarded. The frame source keeps running.
    pub fn stop(&mut self) -> Result<(), ScannerError> {
        let current = self.status();
        if !current.is_active() {
            return Err(ScannerError::InvalidTransition {
                from: current,
                to: ScanStatus::Ready,
            });
        }

        self.end_session();
        tracing::info!(from = %current, "scan stopped");
        transition(&self.status, ScanStatus::Ready)
    }

    /// Stop scanning if needed and stop the frame source.
    pub fn close(&mut self) {
        if self.status().is_active() {
            let _ = self.stop();
        }
        self.source.stop();
    }

    /// Caller confirmed the detection (identity matched and recorded).
    pub fn mark_verified(&self) -> Result<(), ScannerError> {
        transition(&self.status, ScanStatus::Verified)
    }

    /// Caller rejected the detection.
    pub fn mark_failed(&self) -> Result<(), ScannerError> {
        transition(&self.status, ScanStatus::Failed)
    }

    /// Let tick results drive the status again after `Verified`/`Failed`.
    pub fn resume(&self) -> Result<(), ScannerError> {
        let current = self.status();
        if !matches!(current, ScanStatus::Verified | ScanStatus::Failed) {
            return Err(ScannerError::InvalidTransition {
                from: current,
                to: ScanStatus::Scanning,
            });
        }
        transition(&self.status, ScanStatus::Scanning)
    }

    fn end_session(&mut self) {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.end_session();
    }
}

fn transition(status: &watch::Sender<ScanStatus>, to: ScanStatus) -> Result<(), ScannerError> {
    let mut outcome = Ok(());
    status.send_if_modified(|current| {
        if current.can_transition_to(to) {
            tracing::debug!(from = %current, to = %to, "scanner transition");
            *current = to;
            true
        } else {
            outcome = Err(ScannerError::InvalidTransition { from: *current, to });
            false
        }
    });
    outcome
}

/// Classify a tick. Only `Scanning`/`Detected` are driven by ticks; the
/// caller owns `Verified`/`Failed`.
fn apply_tick(status: &watch::Sender<ScanStatus>, detected: bool) {
    let next = if detected {
        ScanStatus::Detected
    } else {
        ScanStatus::Scanning
    };
    status.send_if_modified(|current| match *current {
        ScanStatus::Scanning | ScanStatus::Detected if *current != next => {
            *current = next;
            true
        }
        _ => false,
    });
}

#[allow(clippy::too_many_arguments)]
async fn scan_loop<F>(
    source: Arc<dyn FrameSource>,
    extractor: Arc<dyn EmbeddingExtractor>,
    interval: Duration,
    status: Arc<watch::Sender<ScanStatus>>,
    generation: Arc<Mutex<u64>>,
    session: u64,
    mut sink: F,
) where
    F: FnMut(DetectionResult) + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick = 0u64;

    loop {
        ticker.tick().await;
        tick += 1;

        let result = run_tick(&source, &extractor).await;

        {
            let current = generation.lock().unwrap_or_else(PoisonError::into_inner);
            if *current != session {
                tracing::debug!(session, tick, "scan session ended; discarding in-flight result");
                return;
            }
            apply_tick(&status, result.detected);
            tracing::trace!(
                session,
                tick,
                detected = result.detected,
                confidence = result.confidence,
                "scan tick"
            );
            sink(result);
        }
    }
}

/// Capture one frame and run the extractor on the blocking pool.
async fn run_tick(
    source: &Arc<dyn FrameSource>,
    extractor: &Arc<dyn EmbeddingExtractor>,
) -> DetectionResult {
    let source = Arc::clone(source);
    let extractor = Arc::clone(extractor);

    let outcome = tokio::task::spawn_blocking(move || match source.current_frame() {
        Some(frame) => extractor.detect(&frame),
        None => Ok(None),
    })
    .await;

    match outcome {
        Ok(Ok(Some(detection))) => detection.into(),
        Ok(Ok(None)) => DetectionResult::none(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "face detection failed; treating tick as no face");
            DetectionResult::none()
        }
        Err(e) => {
            tracing::error!(error = %e, "detection task failed");
            DetectionResult::none()
        }
    }
}
