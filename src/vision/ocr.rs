//! OCR (Optical Character Recognition) adapter
//!
//! Owns the single long-lived OCR engine of a scan session. The engine is
//! built lazily on first use, its language is reloaded only when the locale
//! asks for a different model, and parameters are pushed only when they
//! change. Every call holds the engine lock for the whole configure +
//! recognize sequence, so a parameter change can never race a recognition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CapturedFrame;
use crate::config::OcrSettings;

/// OCR failures
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR engine initialization failed: {0}")]
    EngineInit(String),
    #[error("OCR recognition failed: {0}")]
    Recognition(String),
    #[error("image cannot be handed to the OCR engine: {0}")]
    InvalidImage(String),
    #[error("OCR call cancelled")]
    Cancelled,
}

/// Recognition model selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrLanguage {
    /// English only
    English,
    /// Norwegian + English dual model
    NorwegianEnglish,
}

impl OcrLanguage {
    /// Norwegian locales (nb, nn, no) pick the dual model, anything else English
    pub fn from_locale(locale: &str) -> Self {
        let locale = locale.trim().to_ascii_lowercase();
        let is_norwegian = ["nb", "nn", "no"].iter().any(|prefix| {
            locale.strip_prefix(prefix).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with('-') || rest.starts_with('_') || rest.starts_with("rwegian")
            })
        });

        if is_norwegian {
            OcrLanguage::NorwegianEnglish
        } else {
            OcrLanguage::English
        }
    }

    /// Traineddata code understood by tesseract
    pub fn model_code(self) -> &'static str {
        match self {
            OcrLanguage::English => "eng",
            OcrLanguage::NorwegianEnglish => "nor+eng",
        }
    }
}

/// Engine parameters that can change between calls
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OcrParams {
    /// Page segmentation mode
    pub page_segmentation_mode: u8,
    /// Restrict recognition to these characters
    pub char_whitelist: Option<String>,
}

/// One call's settings
#[derive(Debug, Clone)]
pub struct OcrRequest {
    /// Locale used to pick the model
    pub locale: String,
    /// Engine parameters
    pub params: OcrParams,
    /// Hard deadline for this call
    pub timeout: Duration,
}

impl OcrRequest {
    /// Build a request from the OCR config section
    pub fn from_settings(settings: &OcrSettings) -> Self {
        Self {
            locale: settings.locale.clone(),
            params: OcrParams {
                page_segmentation_mode: settings.page_segmentation_mode,
                char_whitelist: settings.char_whitelist.clone(),
            },
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }
}

impl Default for OcrRequest {
    fn default() -> Self {
        Self::from_settings(&OcrSettings::default())
    }
}

/// A line as reported by the engine, confidence on its native 0-100 scale
#[derive(Debug, Clone, PartialEq)]
pub struct EngineLine {
    pub text: String,
    pub confidence: f32,
}

/// A recognized line with confidence scaled to 0-1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

impl From<EngineLine> for OcrLine {
    fn from(line: EngineLine) -> Self {
        Self {
            text: line.text,
            confidence: (line.confidence / 100.0).clamp(0.0, 1.0),
        }
    }
}

/// Black-box text recognizer
#[async_trait]
pub trait OcrEngine: Send {
    /// Load (or reload) the recognition model for `language`
    async fn load_language(&mut self, language: OcrLanguage) -> Result<(), OcrError>;

    /// Apply segmentation / whitelist parameters
    async fn set_parameters(&mut self, params: &OcrParams) -> Result<(), OcrError>;

    /// Recognize an image to plain text
    async fn recognize_text(&mut self, image: &CapturedFrame) -> Result<String, OcrError>;

    /// Recognize an image to lines with native confidences
    async fn recognize_lines(&mut self, image: &CapturedFrame) -> Result<Vec<EngineLine>, OcrError>;
}

type EngineFactory<E> = Box<dyn Fn() -> Result<E, OcrError> + Send + Sync>;

struct EngineSlot<E> {
    engine: Option<E>,
    language: Option<OcrLanguage>,
    params: Option<OcrParams>,
}

/// Session-owned wrapper around one OCR engine instance
pub struct TextRecognizer<E: OcrEngine> {
    slot: Mutex<EngineSlot<E>>,
    factory: EngineFactory<E>,
}

impl<E: OcrEngine> TextRecognizer<E> {
    /// Create a recognizer; `factory` runs on first use only
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<E, OcrError> + Send + Sync + 'static,
    {
        Self {
            slot: Mutex::new(EngineSlot {
                engine: None,
                language: None,
                params: None,
            }),
            factory: Box::new(factory),
        }
    }

    /// Whether the engine has been constructed yet
    pub async fn is_initialized(&self) -> bool {
        self.slot.lock().await.engine.is_some()
    }

    /// Recognize to plain text; timeouts and engine failures yield ""
    pub async fn recognize_text(
        &self,
        image: &CapturedFrame,
        request: &OcrRequest,
        cancel: &CancellationToken,
    ) -> Result<String, OcrError> {
        match self.run(image, request, cancel, CallKind::Text).await? {
            Some(CallOutput::Text(text)) => Ok(text),
            _ => Ok(String::new()),
        }
    }

    /// Recognize to lines with 0-1 confidences; timeouts and engine failures yield no lines
    pub async fn recognize_lines(
        &self,
        image: &CapturedFrame,
        request: &OcrRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<OcrLine>, OcrError> {
        let lines = match self.run(image, request, cancel, CallKind::Lines).await? {
            Some(CallOutput::Lines(lines)) => lines,
            _ => return Ok(vec![]),
        };

        Ok(lines
            .into_iter()
            .filter(|line| !line.text.trim().is_empty())
            .map(OcrLine::from)
            .collect())
    }

    /// Configure and call the engine under the lock, racing the deadline
    /// and the cancellation token. Only cancellation is reported as an error.
    async fn run(
        &self,
        image: &CapturedFrame,
        request: &OcrRequest,
        cancel: &CancellationToken,
        kind: CallKind,
    ) -> Result<Option<CallOutput>, OcrError> {
        if cancel.is_cancelled() {
            return Err(OcrError::Cancelled);
        }

        let work = async {
            let mut guard = self.slot.lock().await;
            let slot = &mut *guard;
            let engine = self.configure(slot, request).await?;
            match kind {
                CallKind::Text => engine.recognize_text(image).await.map(CallOutput::Text),
                CallKind::Lines => engine.recognize_lines(image).await.map(CallOutput::Lines),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("OCR call cancelled");
                Err(OcrError::Cancelled)
            }
            result = tokio::time::timeout(request.timeout, work) => match result {
                Ok(Ok(output)) => Ok(Some(output)),
                Ok(Err(e)) => {
                    warn!("OCR failed, treating frame as unreadable: {}", e);
                    Ok(None)
                }
                Err(_) => {
                    warn!("OCR timed out after {:?}", request.timeout);
                    Ok(None)
                }
            },
        }
    }

    /// Build the engine if needed and bring language / parameters in line
    /// with the request, skipping engine calls for unchanged settings
    async fn configure<'s>(
        &self,
        slot: &'s mut EngineSlot<E>,
        request: &OcrRequest,
    ) -> Result<&'s mut E, OcrError> {
        if slot.engine.is_none() {
            info!("Initializing OCR engine");
            slot.engine = Some((self.factory)()?);
            slot.language = None;
            slot.params = None;
        }
        let Some(engine) = slot.engine.as_mut() else {
            return Err(OcrError::EngineInit("engine missing after construction".to_string()));
        };

        let language = OcrLanguage::from_locale(&request.locale);
        if slot.language != Some(language) {
            info!("Loading OCR language {}", language.model_code());
            // Cleared first so an interrupted load is retried next call
            slot.language = None;
            engine.load_language(language).await?;
            slot.language = Some(language);
        }

        if slot.params.as_ref() != Some(&request.params) {
            debug!("Setting OCR parameters {:?}", request.params);
            slot.params = None;
            engine.set_parameters(&request.params).await?;
            slot.params = Some(request.params.clone());
        }

        Ok(engine)
    }
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Text,
    Lines,
}

enum CallOutput {
    Text(String),
    Lines(Vec<EngineLine>),
}
