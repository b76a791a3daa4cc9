//! Tesseract OCR backend
//!
//! Wraps the system `tesseract` binary through rusty-tesseract. Calls are
//! blocking (a child process per call), so they run on the blocking pool.

use async_trait::async_trait;
use image::{DynamicImage, RgbaImage};
use rusty_tesseract::{Args, Image};
use std::collections::HashMap;
use tracing::{debug, info};

use super::ocr::{EngineLine, OcrEngine, OcrError, OcrLanguage, OcrParams};
use crate::capture::CapturedFrame;

/// Tesseract config variable restricting recognized characters
const WHITELIST_VARIABLE: &str = "tessedit_char_whitelist";

/// Tesseract-backed OCR engine
pub struct TesseractEngine {
    args: Args,
}

impl TesseractEngine {
    /// Check that tesseract is installed and create the engine
    pub fn new() -> Result<Self, OcrError> {
        let version = rusty_tesseract::get_tesseract_version()
            .map_err(|e| OcrError::EngineInit(e.to_string()))?;
        info!("Using tesseract {}", version.lines().next().unwrap_or_default());

        Ok(Self {
            args: Args {
                lang: OcrLanguage::English.model_code().to_string(),
                config_variables: HashMap::new(),
                dpi: Some(300),
                psm: Some(6),
                oem: Some(3),
            },
        })
    }

    /// Language code currently loaded
    pub fn language_code(&self) -> &str {
        &self.args.lang
    }

    /// Run a blocking tesseract call on the blocking pool
    async fn call<T, F>(&self, image: &CapturedFrame, f: F) -> Result<T, OcrError>
    where
        T: Send + 'static,
        F: FnOnce(&Image, &Args) -> Result<T, OcrError> + Send + 'static,
    {
        let dynamic = to_dynamic_image(image)?;
        let args = self.args.clone();

        tokio::task::spawn_blocking(move || {
            let tess_image = Image::from_dynamic_image(&dynamic)
                .map_err(|e| OcrError::InvalidImage(e.to_string()))?;
            f(&tess_image, &args)
        })
        .await
        .map_err(|e| OcrError::Recognition(format!("tesseract task failed: {}", e)))?
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn load_language(&mut self, language: OcrLanguage) -> Result<(), OcrError> {
        self.args.lang = language.model_code().to_string();
        Ok(())
    }

    async fn set_parameters(&mut self, params: &OcrParams) -> Result<(), OcrError> {
        self.args.psm = Some(params.page_segmentation_mode as i32);
        match &params.char_whitelist {
            Some(whitelist) => {
                self.args
                    .config_variables
                    .insert(WHITELIST_VARIABLE.to_string(), whitelist.clone());
            }
            None => {
                self.args.config_variables.remove(WHITELIST_VARIABLE);
            }
        }
        Ok(())
    }

    async fn recognize_text(&mut self, image: &CapturedFrame) -> Result<String, OcrError> {
        debug!("Tesseract: text for {}x{} image", image.width, image.height);
        self.call(image, |img, args| {
            rusty_tesseract::image_to_string(img, args).map_err(|e| OcrError::Recognition(e.to_string()))
        })
        .await
    }

    async fn recognize_lines(&mut self, image: &CapturedFrame) -> Result<Vec<EngineLine>, OcrError> {
        debug!("Tesseract: lines for {}x{} image", image.width, image.height);
        let words = self
            .call(image, |img, args| {
                let output = rusty_tesseract::image_to_data(img, args)
                    .map_err(|e| OcrError::Recognition(e.to_string()))?;
                Ok(output
                    .data
                    .into_iter()
                    .map(|d| WordBox {
                        key: (d.block_num, d.par_num, d.line_num),
                        word_num: d.word_num,
                        text: d.text,
                        conf: d.conf,
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        Ok(group_words_into_lines(words))
    }
}

/// One word from tesseract's TSV output
#[derive(Debug, Clone)]
struct WordBox {
    /// (block, paragraph, line)
    key: (i32, i32, i32),
    word_num: i32,
    text: String,
    conf: f32,
}

/// Join words into lines in reading order; line confidence is the mean of
/// its word confidences (tesseract reports -1 for non-word rows)
fn group_words_into_lines(mut words: Vec<WordBox>) -> Vec<EngineLine> {
    words.retain(|w| !w.text.trim().is_empty() && w.conf >= 0.0);
    words.sort_by(|a, b| a.key.cmp(&b.key).then(a.word_num.cmp(&b.word_num)));

    let mut lines: Vec<EngineLine> = Vec::new();
    let mut current_key = None;
    let mut conf_sum = 0.0f32;
    let mut word_count = 0usize;

    for word in words {
        if current_key != Some(word.key) {
            if let Some(line) = lines.last_mut() {
                line.confidence = conf_sum / word_count.max(1) as f32;
            }
            lines.push(EngineLine {
                text: String::new(),
                confidence: 0.0,
            });
            current_key = Some(word.key);
            conf_sum = 0.0;
            word_count = 0;
        }

        if let Some(line) = lines.last_mut() {
            if !line.text.is_empty() {
                line.text.push(' ');
            }
            line.text.push_str(word.text.trim());
        }
        conf_sum += word.conf;
        word_count += 1;
    }

    if let Some(line) = lines.last_mut() {
        line.confidence = conf_sum / word_count.max(1) as f32;
    }

    lines
}

fn to_dynamic_image(frame: &CapturedFrame) -> Result<DynamicImage, OcrError> {
    RgbaImage::from_raw(frame.width, frame.height, frame.data.clone())
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| {
            OcrError::InvalidImage(format!(
                "{} bytes do not make a {}x{} RGBA image",
                frame.data.len(),
                frame.width,
                frame.height
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(key: (i32, i32, i32), word_num: i32, text: &str, conf: f32) -> WordBox {
        WordBox {
            key,
            word_num,
            text: text.to_string(),
            conf,
        }
    }

    #[test]
    fn test_group_words_into_lines() {
        let words = vec![
            word((1, 1, 2), 1, "0,5", 60.0),
            word((1, 1, 1), 2, "Max", 80.0),
            word((1, 1, 1), 1, "Pepsi", 90.0),
            word((1, 1, 1), 0, "", -1.0),
            word((1, 1, 2), 2, "liter", 70.0),
        ];

        let lines = group_words_into_lines(words);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Pepsi Max");
        assert!((lines[0].confidence - 85.0).abs() < 0.001);
        assert_eq!(lines[1].text, "0,5 liter");
        assert!((lines[1].confidence - 65.0).abs() < 0.001);
    }

    #[test]
    fn test_group_words_empty() {
        assert!(group_words_into_lines(vec![]).is_empty());
    }

    #[test]
    fn test_to_dynamic_image_rejects_bad_buffer() {
        let frame = CapturedFrame::new(vec![0; 5], 2, 2, 0);
        assert!(matches!(to_dynamic_image(&frame), Err(OcrError::InvalidImage(_))));
    }
}
