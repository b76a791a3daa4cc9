//! Frame input
//!
//! The camera layer hands frames in as RGBA buffers. For offline runs the
//! CLI loads still images from disk into the same shape.

pub mod frame;

pub use frame::{CapturedFrame, PackagingKind};

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

/// Load an image file as an RGBA frame stamped with `timestamp_ms`
pub fn load_frame(path: &Path, timestamp_ms: u64) -> Result<CapturedFrame> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    debug!("Loaded {} ({}x{})", path.display(), width, height);

    Ok(CapturedFrame::new(image.into_raw(), width, height, timestamp_ms))
}

/// Write an RGBA frame to disk; format follows the file extension
pub fn save_frame(frame: &CapturedFrame, path: &Path) -> Result<()> {
    let buffer = image::RgbaImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| anyhow::anyhow!("Frame buffer does not match {}x{}", frame.width, frame.height))?;
    buffer
        .save(path)
        .with_context(|| format!("Failed to write image {}", path.display()))?;
    Ok(())
}
