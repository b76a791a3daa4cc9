//! Vision/OCR Layer
//!
//! Prepares camera frames for OCR and runs them through the session's OCR
//! engine:
//! - preprocessing presets (`normal`, `aggressive`)
//! - frame quality metrics for better-shot guidance
//! - the engine adapter (lazy construction, timeout, cancellation)
//! - a tesseract backend

pub mod ocr;
pub mod ocr_preprocess;
pub mod quality;
pub mod tesseract;

pub use ocr::{EngineLine, OcrEngine, OcrError, OcrLanguage, OcrLine, OcrParams, OcrRequest, TextRecognizer};
pub use ocr_preprocess::{apply_preprocessing, preprocess_frame, preprocess_frame_with, PreprocessResult};
pub use quality::{assess_frame, FrameQuality};
pub use tesseract::TesseractEngine;
