//! Frame quality metrics
//!
//! Cheap whole-frame measurements used to decide whether to ask the user
//! for a better photo: sharpness (Laplacian variance), glare (saturated
//! pixels) and brightness.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::capture::CapturedFrame;

/// Laplacian variance at which sharpness reads 0.5
const SHARPNESS_HALF_POINT: f32 = 300.0;

/// Channel value treated as blown out
const SATURATION_LEVEL: u8 = 245;

/// Saturated-pixel fraction that maps to full glare
const GLARE_FULL_FRACTION: f32 = 0.12;

/// Brightness with the best exposure score
const IDEAL_BRIGHTNESS: f32 = 0.55;

/// Quality measurements for one frame, all in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameQuality {
    /// Higher is sharper
    pub sharpness: f32,
    /// Higher means more blown-out highlights
    pub glare: f32,
    /// Mean luminance
    pub brightness: f32,
    /// Blend of the above
    pub overall: f32,
}

impl Default for FrameQuality {
    fn default() -> Self {
        Self {
            sharpness: 0.0,
            glare: 0.0,
            brightness: 0.0,
            overall: 0.0,
        }
    }
}

/// Measure a frame; malformed frames score zero everywhere
pub fn assess_frame(frame: &CapturedFrame) -> FrameQuality {
    if !frame.is_well_formed() {
        return FrameQuality::default();
    }

    let pixel_count = frame.width as usize * frame.height as usize;
    let mut gray = GrayImage::new(frame.width, frame.height);
    let mut saturated = 0usize;
    let mut luminance_sum = 0f64;

    for (i, chunk) in frame.data.chunks_exact(4).enumerate() {
        let (r, g, b) = (chunk[0], chunk[1], chunk[2]);
        if r >= SATURATION_LEVEL && g >= SATURATION_LEVEL && b >= SATURATION_LEVEL {
            saturated += 1;
        }
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        luminance_sum += luma as f64;

        let x = (i % frame.width as usize) as u32;
        let y = (i / frame.width as usize) as u32;
        gray.put_pixel(x, y, Luma([luma.round() as u8]));
    }

    let variance = laplacian_variance(&gray);
    let sharpness = variance / (variance + SHARPNESS_HALF_POINT);
    let glare = (saturated as f32 / pixel_count as f32 / GLARE_FULL_FRACTION).min(1.0);
    let brightness = (luminance_sum / pixel_count as f64 / 255.0) as f32;
    let exposure = (1.0 - (brightness - IDEAL_BRIGHTNESS).abs() / IDEAL_BRIGHTNESS).clamp(0.0, 1.0);

    let overall = 0.5 * sharpness + 0.3 * (1.0 - glare) + 0.2 * exposure;

    FrameQuality {
        sharpness,
        glare,
        brightness,
        overall: overall.clamp(0.0, 1.0),
    }
}

/// Variance of the 4-neighbour Laplacian; higher means sharper edges
fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = gray.get_pixel(x, y).0[0] as f64;
            let top = gray.get_pixel(x, y - 1).0[0] as f64;
            let bottom = gray.get_pixel(x, y + 1).0[0] as f64;
            let left = gray.get_pixel(x - 1, y).0[0] as f64;
            let right = gray.get_pixel(x + 1, y).0[0] as f64;

            let laplacian = top + bottom + left + right - 4.0 * center;
            sum += laplacian;
            sum_sq += laplacian * laplacian;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    ((sum_sq / count as f64) - mean * mean).max(0.0) as f32
}
