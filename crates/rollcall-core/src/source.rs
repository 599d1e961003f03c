//! External collaborators consumed by the scanner and session: frame
//! source, embedding extractor, geolocation.

use crate::types::{BoundingBox, Embedding, GeoPosition};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    /// File the frame was decoded from, for replayed sources.
    pub origin: Option<PathBuf>,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("frame source not found: {0}")]
    NotFound(String),
    #[error("frame source busy")]
    Busy,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("frame source failed: {0}")]
    Failed(String),
}

/// Camera or camera-like feed.
pub trait FrameSource: Send + Sync {
    /// Begin producing frames. Calling `start` on a running source is a no-op.
    fn start(&self) -> Result<(), FrameSourceError>;
    fn stop(&self);
    /// The most recent frame, or `None` when nothing is available.
    fn current_frame(&self) -> Option<Frame>;
}

/// One face found by the extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Detector confidence in [0, 1].
    pub score: f32,
    pub embedding: Embedding,
    pub bounding_box: BoundingBox,
}

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("extractor used before its model was loaded")]
    NotLoaded,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face detector plus descriptor network.
pub trait EmbeddingExtractor: Send + Sync {
    /// Load the model from `model_location`. Called once per scanner.
    fn load(&self, model_location: &str) -> Result<(), ExtractorError>;
    /// Detect a single face and compute its embedding; `None` when no face.
    fn detect(&self, frame: &Frame) -> Result<Option<Detection>, ExtractorError>;
}

/// Options for a geolocation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoOptions {
    pub timeout: Duration,
    pub high_accuracy: bool,
}

impl Default for GeoOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            high_accuracy: true,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable")]
    Unavailable,
    #[error("location request timed out")]
    Timeout,
    #[error("unknown geolocation error")]
    Unknown,
}

pub trait GeolocationProvider: Send + Sync {
    /// Blocking request for the current position.
    fn current_position(&self, options: &GeoOptions) -> Result<GeoPosition, GeoError>;
}
