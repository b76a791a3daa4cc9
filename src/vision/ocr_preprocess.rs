//! Image preprocessing filters for OCR optimization
//!
//! Turns a raw camera frame into a high-contrast, (usually) binarized
//! bitmap. Packaging photos have glossy, colored and unevenly lit labels,
//! so the default binarization is a local-mean (adaptive) threshold.

use image::{imageops::FilterType, GrayImage, Luma, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::integral_image::integral_image;
use tracing::{debug, warn};

use crate::capture::CapturedFrame;
use crate::config::{PreprocessOptions, PreprocessPreset, ThresholdMethod};

/// Share of chroma added back to luminance when color boost is on
const CHROMA_LIFT: f32 = 0.25;

/// Result of preprocessing that includes potentially resized dimensions
#[derive(Debug, Clone)]
pub struct PreprocessResult {
    /// Processed RGBA data (gray in every color channel, alpha 255)
    pub data: Vec<u8>,
    /// New width (may differ from original if upscaled)
    pub width: u32,
    /// New height (may differ from original if upscaled)
    pub height: u32,
}

/// Preprocess a frame with one of the tuned presets
pub fn preprocess_frame(frame: &CapturedFrame, preset: PreprocessPreset) -> CapturedFrame {
    preprocess_frame_with(frame, &preset.options())
}

/// Preprocess a frame with explicit options, keeping its timestamp
pub fn preprocess_frame_with(frame: &CapturedFrame, options: &PreprocessOptions) -> CapturedFrame {
    let result = apply_preprocessing(&frame.data, frame.width, frame.height, options);
    CapturedFrame::new(result.data, result.width, result.height, frame.timestamp_ms)
}

/// Apply the OCR preprocessing pipeline to RGBA image data
///
/// A buffer that does not match `width x height` RGBA comes back unchanged;
/// the scan loop would rather OCR a raw frame than drop it.
pub fn apply_preprocessing(
    data: &[u8],
    width: u32,
    height: u32,
    options: &PreprocessOptions,
) -> PreprocessResult {
    let options = options.clone().normalized();

    let Some(rgba) = RgbaImage::from_raw(width, height, data.to_vec()).filter(|_| width > 0 && height > 0)
    else {
        warn!(
            "Cannot rasterize {}x{} frame from {} bytes, skipping preprocessing",
            width,
            height,
            data.len()
        );
        return PreprocessResult {
            data: data.to_vec(),
            width,
            height,
        };
    };

    debug!(
        "OCR preprocessing: threshold={} ({:?}), contrast={}, denoise={}, sharpen={}, upscale={}",
        options.enable_threshold,
        options.threshold_method,
        options.contrast,
        options.denoise,
        options.sharpen,
        options.upscale
    );

    // Upscale first, before the other filters, for better interpolation quality
    let rgba = if options.upscale > 1.01 {
        let new_width = ((width as f32 * options.upscale).round() as u32).max(1);
        let new_height = ((height as f32 * options.upscale).round() as u32).max(1);
        image::imageops::resize(&rgba, new_width, new_height, FilterType::Triangle)
    } else {
        rgba
    };
    let (width, height) = rgba.dimensions();

    let mut gray = to_luminance(&rgba, options.color_boost);
    stretch_and_contrast(&mut gray, options.contrast);

    if options.denoise {
        gray = horizontal_mean(&gray);
    }

    if options.sharpen {
        gray = sharpen(&gray);
    }

    if options.enable_threshold {
        gray = match options.threshold_method {
            ThresholdMethod::Quantile => {
                let level = quantile_level(&gray, options.auto_threshold_quantile);
                binarize_global(&gray, level)
            }
            ThresholdMethod::Otsu => {
                let level = imageproc::contrast::otsu_level(&gray);
                binarize_global(&gray, level)
            }
            ThresholdMethod::Adaptive => {
                adaptive_threshold(&gray, options.adaptive_window_size, options.adaptive_offset)
            }
        };

        if options.morphology_open {
            gray = open_ink(&gray);
        }
    }

    PreprocessResult {
        data: gray_to_rgba(&gray),
        width,
        height,
    }
}

/// Luminance, optionally lifted by chroma so that saturated background
/// colors wash out towards paper white while neutral ink stays dark
fn to_luminance(rgba: &RgbaImage, color_boost: bool) -> GrayImage {
    let mut gray = GrayImage::new(rgba.width(), rgba.height());

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, _] = pixel.0;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let mut value = 0.299 * r + 0.587 * g + 0.114 * b;

        if color_boost {
            let chroma = r.max(g).max(b) - r.min(g).min(b);
            value += chroma * CHROMA_LIFT;
        }

        gray.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
    }

    gray
}

/// Stretch observed min/max to 0-255, then apply contrast around the midpoint
fn stretch_and_contrast(gray: &mut GrayImage, contrast: f32) {
    let (min, max) = gray
        .pixels()
        .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    let range = max.saturating_sub(min) as f32;

    for pixel in gray.pixels_mut() {
        let mut value = pixel.0[0] as f32;
        if range > 0.0 {
            value = (value - min as f32) * 255.0 / range;
        }
        // Contrast around midpoint (128)
        let adjusted = ((value - 128.0) * contrast + 128.0).clamp(0.0, 255.0);
        pixel.0[0] = adjusted.round() as u8;
    }
}

/// 3-tap horizontal mean; edge pixels average the taps that exist
fn horizontal_mean(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut result = gray.clone();

    for y in 0..h {
        for x in 0..w {
            let mut sum = gray.get_pixel(x, y).0[0] as u32;
            let mut count = 1;
            if x > 0 {
                sum += gray.get_pixel(x - 1, y).0[0] as u32;
                count += 1;
            }
            if x + 1 < w {
                sum += gray.get_pixel(x + 1, y).0[0] as u32;
                count += 1;
            }
            result.put_pixel(x, y, Luma([((sum + count / 2) / count) as u8]));
        }
    }

    result
}

/// 5-point sharpening: center x5 minus the four neighbours, clamped
fn sharpen(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut result = gray.clone();
    if w < 3 || h < 3 {
        return result;
    }

    // Edges are left untouched
    for y in 1..(h - 1) {
        for x in 1..(w - 1) {
            let center = gray.get_pixel(x, y).0[0] as i32;
            let top = gray.get_pixel(x, y - 1).0[0] as i32;
            let bottom = gray.get_pixel(x, y + 1).0[0] as i32;
            let left = gray.get_pixel(x - 1, y).0[0] as i32;
            let right = gray.get_pixel(x + 1, y).0[0] as i32;

            let sharpened = center * 5 - top - bottom - left - right;
            result.put_pixel(x, y, Luma([sharpened.clamp(0, 255) as u8]));
        }
    }

    result
}

/// Luminance level at or below which `quantile` of the pixels fall
fn quantile_level(gray: &GrayImage, quantile: f32) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total = gray.width() as u64 * gray.height() as u64;
    let target = (total as f64 * quantile as f64).ceil() as u64;
    let mut cumulative = 0u64;
    for (level, count) in histogram.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return level as u8;
        }
    }
    255
}

/// Pixels at or below `level` become ink (0), the rest paper (255)
fn binarize_global(gray: &GrayImage, level: u8) -> GrayImage {
    let mut result = gray.clone();
    for pixel in result.pixels_mut() {
        pixel.0[0] = if pixel.0[0] <= level { 0 } else { 255 };
    }
    result
}

/// Threshold every pixel against its local mean (minus `offset`) over a
/// square window, using a summed-area table for constant-time window sums
fn adaptive_threshold(gray: &GrayImage, window: u32, offset: u8) -> GrayImage {
    let (w, h) = gray.dimensions();
    // integral has a leading zero row and column: I(x, y) = sum of F(x' < x, y' < y).
    // u64: a u32 sum overflows past ~16.8 MP of white
    let integral = integral_image::<_, u64>(gray);
    let half = window / 2;
    let mut result = GrayImage::new(w, h);

    for y in 0..h {
        let y0 = y.saturating_sub(half);
        let y1 = (y + half + 1).min(h);
        for x in 0..w {
            let x0 = x.saturating_sub(half);
            let x1 = (x + half + 1).min(w);

            let sum = integral.get_pixel(x1, y1).0[0] as i64
                - integral.get_pixel(x0, y1).0[0] as i64
                - integral.get_pixel(x1, y0).0[0] as i64
                + integral.get_pixel(x0, y0).0[0] as i64;
            let count = ((x1 - x0) * (y1 - y0)) as i64;
            let mean = sum as f32 / count as f32;

            let value = gray.get_pixel(x, y).0[0] as f32;
            let ink = value < mean - offset as f32;
            result.put_pixel(x, y, Luma([if ink { 0 } else { 255 }]));
        }
    }

    result
}

/// Binary opening (3x3 erosion then dilation) applied to the ink pixels
fn open_ink(binary: &GrayImage) -> GrayImage {
    let mut ink = binary.clone();
    image::imageops::invert(&mut ink);
    let mut opened = imageproc::morphology::open(&ink, Norm::LInf, 1);
    image::imageops::invert(&mut opened);
    opened
}

/// Expand a gray image back to opaque RGBA
fn gray_to_rgba(gray: &GrayImage) -> Vec<u8> {
    let mut data = Vec::with_capacity(gray.width() as usize * gray.height() as usize * 4);
    for pixel in gray.pixels() {
        let v = pixel.0[0];
        data.extend_from_slice(&[v, v, v, 255]);
    }
    data
}
