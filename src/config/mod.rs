//! Application Configuration
//!
//! Scanner settings stored in TOML format. Every numeric setting is clamped
//! into a usable range on load instead of being rejected, so a slightly odd
//! config file never stops the camera loop.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Scanner settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Image preprocessing for OCR
    pub preprocess: PreprocessSettings,
    /// OCR engine settings
    pub ocr: OcrSettings,
    /// Seed extraction settings
    pub seeds: SeedSettings,
    /// Multi-sample fusion settings
    pub fusion: FusionSettings,
    /// Commit gate thresholds
    pub gate: GateSettings,
    /// Resolver / session settings
    pub resolver: ResolverSettings,
}

impl AppConfig {
    /// Clamp every section into its valid range
    pub fn normalized(mut self) -> Self {
        self.preprocess.options = self.preprocess.options.normalized();
        self.ocr = self.ocr.normalized();
        self.seeds.max_seeds = self.seeds.max_seeds.clamp(1, 32);
        self.fusion = self.fusion.normalized();
        self.gate = self.gate.normalized();
        self.resolver = self.resolver.normalized();
        self
    }
}

/// Binarization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    /// Level below which a fixed fraction of pixels fall
    Quantile,
    /// Level maximizing inter-class variance
    Otsu,
    /// Local mean over a square window (integral image)
    #[default]
    Adaptive,
}

/// Tuned preprocessing bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessPreset {
    /// First pass for every frame
    #[default]
    Normal,
    /// Fallback pass when the first attempt read too little text
    Aggressive,
}

impl PreprocessPreset {
    /// Options for this preset
    pub fn options(self) -> PreprocessOptions {
        match self {
            PreprocessPreset::Normal => PreprocessOptions::default(),
            PreprocessPreset::Aggressive => PreprocessOptions {
                contrast: 1.75,
                denoise: true,
                sharpen: true,
                upscale: 1.7,
                adaptive_window_size: 25,
                adaptive_offset: 9,
                ..PreprocessOptions::default()
            },
        }
    }
}

/// Options for OCR preprocessing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    /// Binarize the output
    pub enable_threshold: bool,
    /// Binarization strategy
    pub threshold_method: ThresholdMethod,
    /// Contrast factor around the midpoint (1.0 = unchanged)
    pub contrast: f32,
    /// 3-tap horizontal mean filter
    pub denoise: bool,
    /// Fraction of pixels below the quantile threshold
    pub auto_threshold_quantile: f32,
    /// 5-point sharpening kernel
    pub sharpen: bool,
    /// Lift saturated colors toward white so colored backgrounds drop out
    pub color_boost: bool,
    /// Upscale factor (1.0 = same size)
    pub upscale: f32,
    /// Side of the adaptive threshold window in pixels (odd)
    pub adaptive_window_size: u32,
    /// Subtracted from the local mean before comparing
    pub adaptive_offset: u8,
    /// Binary opening (3x3) after thresholding
    pub morphology_open: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            enable_threshold: true,
            threshold_method: ThresholdMethod::Adaptive,
            contrast: 1.35,
            denoise: false,
            auto_threshold_quantile: 0.55,
            sharpen: false,
            color_boost: true,
            upscale: 1.0,
            adaptive_window_size: 17,
            adaptive_offset: 7,
            morphology_open: true,
        }
    }
}

impl PreprocessOptions {
    /// Clamp values into ranges the filters can work with
    pub fn normalized(mut self) -> Self {
        if !self.contrast.is_finite() {
            self.contrast = 1.0;
        }
        self.contrast = self.contrast.clamp(0.1, 4.0);

        if !self.auto_threshold_quantile.is_finite() {
            self.auto_threshold_quantile = 0.55;
        }
        self.auto_threshold_quantile = self.auto_threshold_quantile.clamp(0.01, 0.99);

        if !self.upscale.is_finite() {
            self.upscale = 1.0;
        }
        self.upscale = self.upscale.clamp(1.0, 4.0);

        // Window must be odd and at least 3
        self.adaptive_window_size = self.adaptive_window_size.clamp(3, 255) | 1;
        self
    }
}

/// Preprocessing section of the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Preset used for the first pass
    pub preset: PreprocessPreset,
    /// Explicit overrides for the first pass (used when preset is normal)
    pub options: PreprocessOptions,
}

impl PreprocessSettings {
    /// Options for the first OCR pass
    pub fn first_pass(&self) -> PreprocessOptions {
        match self.preset {
            PreprocessPreset::Normal => self.options.clone().normalized(),
            PreprocessPreset::Aggressive => PreprocessPreset::Aggressive.options(),
        }
    }
}

/// OCR engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Locale tag, e.g. "nb-NO" or "en-US"
    pub locale: String,
    /// Hard deadline per recognize call in milliseconds
    pub timeout_ms: u64,
    /// Tesseract page segmentation mode
    pub page_segmentation_mode: u8,
    /// Restrict recognition to these characters
    pub char_whitelist: Option<String>,
    /// Retry with the aggressive preset below this many letters
    pub min_text_chars_before_retry: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            locale: "nb-NO".to_string(),
            timeout_ms: 9000,
            page_segmentation_mode: 6,
            char_whitelist: None,
            min_text_chars_before_retry: 4,
        }
    }
}

impl OcrSettings {
    fn normalized(mut self) -> Self {
        self.timeout_ms = self.timeout_ms.clamp(100, 60_000);
        self.page_segmentation_mode = self.page_segmentation_mode.min(13);
        if self.char_whitelist.as_deref().is_some_and(|w| w.trim().is_empty()) {
            self.char_whitelist = None;
        }
        self
    }
}

/// Seed extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedSettings {
    /// Maximum number of seeds handed to product search
    pub max_seeds: usize,
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self { max_seeds: 6 }
    }
}

/// Multi-sample fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    /// Two readings belong to one group at or above this similarity
    pub similarity_threshold: f32,
    /// Samples older than this are evicted from the session window
    pub window_ms: u64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.78,
            window_ms: 2500,
        }
    }
}

impl FusionSettings {
    fn normalized(mut self) -> Self {
        if !self.similarity_threshold.is_finite() {
            self.similarity_threshold = 0.78;
        }
        self.similarity_threshold = self.similarity_threshold.clamp(0.5, 0.99);
        self.window_ms = self.window_ms.clamp(250, 30_000);
        self
    }
}

/// Commit gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Minimum fused confidence
    pub min_confidence: f32,
    /// Minimum consecutive rounds with the same fused text (never below 3)
    pub min_stable_count: u32,
    /// Minimum wall-clock persistence of the fused text
    pub min_continuity_ms: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.85,
            min_stable_count: 3,
            min_continuity_ms: 500,
        }
    }
}

impl GateSettings {
    fn normalized(mut self) -> Self {
        if !self.min_confidence.is_finite() {
            self.min_confidence = 0.85;
        }
        self.min_confidence = self.min_confidence.clamp(0.5, 0.99);
        self.min_stable_count = self.min_stable_count.max(3);
        self
    }
}

/// Resolver and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Repeat recognitions of one product inside this window are suppressed
    pub duplicate_window_ms: u64,
    /// Maximum image entries kept by the session cache
    pub cache_max_images: usize,
    /// Largest boost given to recently logged items
    pub recent_boost: f32,
    /// Continuity below this drops the tracked object
    pub tracking_lost_continuity: f32,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            duplicate_window_ms: 6000,
            cache_max_images: 128,
            recent_boost: 0.04,
            tracking_lost_continuity: 0.15,
        }
    }
}

impl ResolverSettings {
    fn normalized(mut self) -> Self {
        self.cache_max_images = self.cache_max_images.max(1);
        if !self.recent_boost.is_finite() {
            self.recent_boost = 0.04;
        }
        self.recent_boost = self.recent_boost.clamp(0.0, 0.2);
        if !self.tracking_lost_continuity.is_finite() {
            self.tracking_lost_continuity = 0.15;
        }
        self.tracking_lost_continuity = self.tracking_lost_continuity.clamp(0.0, 1.0);
        self
    }
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "packscan", "PackScan")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Default config file location
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("packscan.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config.normalized())
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
