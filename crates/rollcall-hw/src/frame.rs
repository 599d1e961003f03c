//! Frame decoding and dark-frame detection.

use rollcall_core::Frame;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Decode an image file into a grayscale frame.
pub fn decode_grayscale(path: &Path, sequence: u32) -> Result<Frame, FrameError> {
    let img = image::open(path).map_err(|source| FrameError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    let gray = img.to_luma8();
    let (width, height) = gray.dimensions();

    Ok(Frame {
        data: gray.into_raw(),
        width,
        height,
        timestamp: Instant::now(),
        sequence,
        origin: Some(path.to_path_buf()),
    })
}

/// Check if a frame is dark: true if more than `threshold_pct` of pixels
/// fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}
