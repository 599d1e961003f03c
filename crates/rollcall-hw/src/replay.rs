//! Frame source replaying image files from a directory.
//!
//! Frames are served in file-name order and wrap around at the end. Dark
//! frames (lens covered, lights off) are skipped by default.

use crate::frame::{decode_grayscale, is_dark_frame, DARK_FRAME_THRESHOLD};
use rollcall_core::{Frame, FrameSource, FrameSourceError};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "pgm", "pnm"];

#[derive(Default)]
struct ReplayState {
    frames: Vec<PathBuf>,
    cursor: usize,
    sequence: u32,
    active: bool,
}

pub struct ImageDirSource {
    dir: PathBuf,
    skip_dark: bool,
    state: Mutex<ReplayState>,
}

impl ImageDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            skip_dark: true,
            state: Mutex::new(ReplayState::default()),
        }
    }

    pub fn skip_dark_frames(mut self, skip: bool) -> Self {
        self.skip_dark = skip;
        self
    }

    /// Number of frames found at the last `start`.
    pub fn frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSource for ImageDirSource {
    fn start(&self) -> Result<(), FrameSourceError> {
        let mut state = self.lock();
        if state.active {
            return Ok(());
        }
        if !self.dir.is_dir() {
            return Err(FrameSourceError::NotFound(self.dir.display().to_string()));
        }

        let frames = list_images(&self.dir)?;
        if frames.is_empty() {
            return Err(FrameSourceError::Failed(format!(
                "no image files in {}",
                self.dir.display()
            )));
        }

        tracing::info!(dir = %self.dir.display(), frames = frames.len(), "replay source started");
        state.frames = frames;
        state.cursor = 0;
        state.active = true;
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.lock();
        if state.active {
            tracing::debug!(dir = %self.dir.display(), "replay source stopped");
        }
        state.active = false;
    }

    fn current_frame(&self) -> Option<Frame> {
        let mut state = self.lock();
        if !state.active || state.frames.is_empty() {
            return None;
        }

        // At most one pass over the directory per call.
        for _ in 0..state.frames.len() {
            let path = state.frames[state.cursor].clone();
            state.cursor = (state.cursor + 1) % state.frames.len();
            let sequence = state.sequence;
            state.sequence = state.sequence.wrapping_add(1);

            match decode_grayscale(&path, sequence) {
                Ok(frame) if self.skip_dark && is_dark_frame(&frame.data, DARK_FRAME_THRESHOLD) => {
                    tracing::debug!(seq = sequence, path = %path.display(), "skipping dark frame");
                }
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping undecodable frame");
                }
            }
        }
        None
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, FrameSourceError> {
    let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            FrameSourceError::PermissionDenied(dir.display().to_string())
        }
        _ => FrameSourceError::Failed(format!("{}: {e}", dir.display())),
    })?;

    let mut frames: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    frames.sort();
    Ok(frames)
}
