//! rollcall-hw — Concrete collaborators for the attendance scanner.
//!
//! Replays captured frames from an image directory, reads precomputed
//! face descriptors from JSON sidecars, and supplies fixed geolocation.

pub mod frame;
pub mod geo;
pub mod replay;
pub mod sidecar;

pub use frame::{decode_grayscale, is_dark_frame, FrameError, DARK_FRAME_THRESHOLD};
pub use geo::{FixedLocation, NoLocation};
pub use replay::ImageDirSource;
pub use sidecar::{read_descriptor, DescriptorError, DescriptorRecord, SidecarExtractor};
