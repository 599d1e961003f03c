//! Precomputed face descriptors read from JSON sidecar files.
//!
//! An external detector writes one JSON file per frame, named after the
//! frame's file stem (`frame_0001.png` is described by `frame_0001.json`).
//! A frame without a sidecar has no face in it.
//!
//! Two layouts are accepted:
//!
//! ```json
//! [0.12, -0.03, 0.44]
//! ```
//!
//! ```json
//! { "descriptor": [0.12, -0.03, 0.44], "score": 0.93,
//!   "bounding_box": { "x": 10, "y": 12, "width": 80, "height": 96 } }
//! ```

use rollcall_core::{BoundingBox, Detection, Embedding, EmbeddingExtractor, ExtractorError, Frame};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid descriptor in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("descriptor in {0} is empty")]
    Empty(String),
}

/// One decoded sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub descriptor: Vec<f32>,
    #[serde(default = "default_score")]
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

fn default_score() -> f32 {
    1.0
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    Bare(Vec<f32>),
    Record(DescriptorRecord),
}

impl DescriptorRecord {
    /// Convert into a detection on `frame`. Without a stored box the whole
    /// frame is reported.
    pub fn into_detection(self, frame: &Frame) -> Detection {
        let bounding_box = self.bounding_box.unwrap_or(BoundingBox {
            x: 0.0,
            y: 0.0,
            width: frame.width as f32,
            height: frame.height as f32,
        });
        Detection {
            score: self.score.clamp(0.0, 1.0),
            embedding: Embedding::new(self.descriptor),
            bounding_box,
        }
    }
}

/// Parse a descriptor file in either accepted layout.
pub fn read_descriptor(path: &Path) -> Result<DescriptorRecord, DescriptorError> {
    let display = || path.display().to_string();
    let raw = std::fs::read(path).map_err(|source| DescriptorError::Io {
        path: display(),
        source,
    })?;
    let record = match serde_json::from_slice(&raw) {
        Ok(DescriptorFile::Bare(descriptor)) => DescriptorRecord {
            descriptor,
            score: default_score(),
            bounding_box: None,
        },
        Ok(DescriptorFile::Record(record)) => record,
        Err(source) => {
            return Err(DescriptorError::Parse {
                path: display(),
                source,
            })
        }
    };
    if record.descriptor.is_empty() {
        return Err(DescriptorError::Empty(display()));
    }
    Ok(record)
}

/// Extractor that looks faces up in sidecar files instead of running a model.
///
/// The "model location" passed to `load` is the sidecar directory. An empty
/// location means sidecars sit next to the frames themselves.
#[derive(Default)]
pub struct SidecarExtractor {
    root: Mutex<Option<Root>>,
}

#[derive(Clone)]
enum Root {
    Dir(PathBuf),
    BesideFrames,
}

impl SidecarExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    fn sidecar_for(&self, frame: &Frame) -> Result<PathBuf, ExtractorError> {
        let root = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExtractorError::NotLoaded)?;
        let origin = frame.origin.as_deref().ok_or_else(|| {
            ExtractorError::InferenceFailed(format!(
                "frame {} has no source file to look up",
                frame.sequence
            ))
        })?;
        let stem = origin.file_stem().ok_or_else(|| {
            ExtractorError::InferenceFailed(format!("no file stem in {}", origin.display()))
        })?;
        let name = format!("{}.json", stem.to_string_lossy());

        Ok(match root {
            Root::Dir(dir) => dir.join(name),
            Root::BesideFrames => origin.with_file_name(name),
        })
    }
}

impl EmbeddingExtractor for SidecarExtractor {
    fn load(&self, model_location: &str) -> Result<(), ExtractorError> {
        let root = if model_location.is_empty() {
            Root::BesideFrames
        } else {
            let dir = PathBuf::from(model_location);
            if !dir.is_dir() {
                return Err(ExtractorError::ModelNotFound(model_location.to_string()));
            }
            Root::Dir(dir)
        };
        tracing::info!(location = %model_location, "sidecar descriptors loaded");
        *self.root.lock().unwrap_or_else(PoisonError::into_inner) = Some(root);
        Ok(())
    }

    fn detect(&self, frame: &Frame) -> Result<Option<Detection>, ExtractorError> {
        let path = self.sidecar_for(frame)?;
        if !path.exists() {
            return Ok(None);
        }
        let record =
            read_descriptor(&path).map_err(|e| ExtractorError::InferenceFailed(e.to_string()))?;
        tracing::debug!(seq = frame.sequence, path = %path.display(), "descriptor found");
        Ok(Some(record.into_detection(frame)))
    }
}
