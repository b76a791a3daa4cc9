//! Scoring heuristics around product resolution
//!
//! Confidence bucketing, the wrong-but-confident check, better-shot
//! guidance, front visibility, duplicate suppression and candidate
//! re-ranking (merging, OCR text ties, recent items).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::analysis::text::fold_text;
use crate::capture::PackagingKind;
use crate::vision::FrameQuality;

const HIGH_CONFIDENCE: f32 = 0.8;
const MEDIUM_CONFIDENCE: f32 = 0.2;

const CONFIDENT_SEED: f32 = 0.78;
const WEAK_MATCH: f32 = 0.55;

const LOW_FRAME_QUALITY: f32 = 0.42;
const LOW_TOP_CONFIDENCE: f32 = 0.58;
const LOW_MARGIN: f32 = 0.08;

const GLARE_LIMIT: f32 = 0.62;
const BLUR_LIMIT: f32 = 0.28;
const DARK_LIMIT: f32 = 0.3;

const VISIBILITY_CHAR_CAP: f32 = 18.0;
const VISIBILITY_MARGIN_CAP: f32 = 0.18;

/// Front visibility needed before a repeat view counts as a duplicate
pub const DUPLICATE_MIN_VISIBILITY: f32 = 0.55;

const MAX_SCORE: f32 = 0.99;
const TEXT_TIE_STEP: f32 = 0.05;
const TEXT_TIE_CAP: f32 = 0.2;

/// A product returned by product search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCandidate {
    pub id: String,
    pub brand: String,
    pub name: String,
    /// Combined match confidence (0.0 - 1.0)
    pub score: f32,
}

impl ProductCandidate {
    /// "brand name", trimmed
    pub fn label(&self) -> String {
        format!("{} {}", self.brand.trim(), self.name.trim()).trim().to_string()
    }

    fn folded_label(&self) -> String {
        fold_text(&self.label())
    }
}

/// Confidence label for the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    High,
    Medium,
    Low,
}

pub fn confidence_bucket(confidence: f32) -> ConfidenceBucket {
    if confidence >= HIGH_CONFIDENCE {
        ConfidenceBucket::High
    } else if confidence >= MEDIUM_CONFIDENCE {
        ConfidenceBucket::Medium
    } else {
        ConfidenceBucket::Low
    }
}

/// A confident seed that only found a weak match probably named the
/// wrong product
pub fn is_wrong_but_confident(seed_confidence: f32, best_score: f32) -> bool {
    seed_confidence >= CONFIDENT_SEED && best_score < WEAK_MATCH
}

/// What to tell the user when asking for another photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetterShotHint {
    ReduceGlare,
    HoldSteady,
    MoreLight,
    ShowBarcode,
    MoveCloser,
    TryAgain,
}

impl BetterShotHint {
    pub fn message(self) -> &'static str {
        match self {
            BetterShotHint::ReduceGlare => "Tilt the package to reduce glare",
            BetterShotHint::HoldSteady => "Hold the camera steady, the photo is blurry",
            BetterShotHint::MoreLight => "Find more light",
            BetterShotHint::ShowBarcode => "Show the barcode",
            BetterShotHint::MoveCloser => "Move closer and reduce glare on the label",
            BetterShotHint::TryAgain => "Try another photo of the front label",
        }
    }
}

/// Inputs to the better-shot decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotAssessment {
    pub quality: FrameQuality,
    /// Best candidate score, 0 when nothing matched
    pub top_confidence: f32,
    /// Gap to the runner-up; `None` without alternatives
    pub margin: Option<f32>,
    pub packaging: PackagingKind,
    pub ocr_skipped: bool,
    pub barcode_available: bool,
}

/// Whether to ask for a re-capture
pub fn needs_better_shot(shot: &ShotAssessment) -> bool {
    shot.quality.overall < LOW_FRAME_QUALITY
        || shot.top_confidence < LOW_TOP_CONFIDENCE
        || shot.margin.is_some_and(|m| m < LOW_MARGIN)
        || (shot.packaging.is_container() && shot.ocr_skipped)
}

/// Guidance for a re-capture, most specific problem first
pub fn better_shot_hint(shot: &ShotAssessment) -> BetterShotHint {
    let low_margin = shot.margin.is_some_and(|m| m < LOW_MARGIN);

    if shot.quality.glare > GLARE_LIMIT {
        BetterShotHint::ReduceGlare
    } else if shot.quality.sharpness < BLUR_LIMIT {
        BetterShotHint::HoldSteady
    } else if shot.quality.brightness < DARK_LIMIT {
        BetterShotHint::MoreLight
    } else if shot.barcode_available {
        BetterShotHint::ShowBarcode
    } else if shot.packaging.is_container() && low_margin {
        BetterShotHint::MoveCloser
    } else {
        BetterShotHint::TryAgain
    }
}

/// `Some(hint)` when a re-capture is recommended
pub fn better_shot(shot: &ShotAssessment) -> Option<BetterShotHint> {
    needs_better_shot(shot).then(|| better_shot_hint(shot))
}

/// Inputs to the front-visibility estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityInput {
    pub packaging: PackagingKind,
    pub frame_quality: f32,
    pub best_line_score: f32,
    pub ocr_chars: usize,
    pub top_confidence: f32,
    pub margin: f32,
}

/// How much of the identifying label was visible; 1 for non-containers
pub fn front_visibility(input: &VisibilityInput) -> f32 {
    if !input.packaging.is_container() {
        return 1.0;
    }

    let chars = (input.ocr_chars as f32 / VISIBILITY_CHAR_CAP).min(1.0);
    let margin = (input.margin / VISIBILITY_MARGIN_CAP).clamp(0.0, 1.0);

    (0.28 * input.frame_quality.clamp(0.0, 1.0)
        + 0.34 * input.best_line_score.clamp(0.0, 1.0)
        + 0.18 * chars
        + 0.12 * input.top_confidence.clamp(0.0, 1.0)
        + 0.08 * margin)
        .clamp(0.0, 1.0)
}

/// Remembers when each product was last recognized
#[derive(Debug, Clone)]
pub struct DuplicateMemory {
    window_ms: u64,
    last_seen: HashMap<String, u64>,
}

impl DuplicateMemory {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_seen: HashMap::new(),
        }
    }

    /// Record a recognition of `label`; true when it repeats a recognition
    /// inside the window on a well-visible front
    pub fn check_and_record(&mut self, label: &str, now_ms: u64, visibility: f32) -> bool {
        let key = fold_text(label);
        if key.is_empty() {
            return false;
        }

        let repeat = self
            .last_seen
            .get(&key)
            .is_some_and(|&seen| now_ms.saturating_sub(seen) <= self.window_ms);
        let suppress = repeat && visibility >= DUPLICATE_MIN_VISIBILITY;

        self.last_seen.insert(key, now_ms);
        if suppress {
            debug!("Suppressing duplicate recognition of {:?}", label);
        }
        suppress
    }

    /// Forget entries older than the window
    pub fn prune(&mut self, now_ms: u64) {
        let window = self.window_ms;
        self.last_seen
            .retain(|_, seen| now_ms.saturating_sub(*seen) <= window);
    }

    /// Products currently remembered
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Merge duplicates by normalized label, keeping the best score
pub fn merge_candidates(candidates: Vec<ProductCandidate>) -> Vec<ProductCandidate> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<ProductCandidate> = Vec::new();

    for candidate in candidates {
        let key = candidate.folded_label();
        match index.get(&key) {
            Some(&i) => {
                if candidate.score > merged[i].score {
                    merged[i] = candidate;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(candidate);
            }
        }
    }
    merged
}

/// Boost for label tokens that were actually read off the package
pub fn text_tie_boost(label: &str, text_tokens: &HashSet<String>) -> f32 {
    if text_tokens.is_empty() {
        return 0.0;
    }
    let overlap = fold_text(label)
        .split(' ')
        .filter(|t| !t.is_empty() && text_tokens.contains(*t))
        .count();
    (TEXT_TIE_STEP * overlap as f32).min(TEXT_TIE_CAP)
}

/// Apply text-tie boosts and sort by score
pub fn apply_text_ties(candidates: &mut [ProductCandidate], text_tokens: &HashSet<String>) {
    for candidate in candidates.iter_mut() {
        let boost = text_tie_boost(&candidate.label(), text_tokens);
        if boost > 0.0 {
            candidate.score = (candidate.score + boost).min(MAX_SCORE);
        }
    }
    sort_by_score(candidates);
}

/// Boost candidates related to recently logged items and re-sort; the
/// boost scales with how much of the longer label the shorter one covers
pub fn rerank_recent(candidates: &mut [ProductCandidate], recent: &[String], max_boost: f32) {
    let recent: Vec<String> = recent
        .iter()
        .map(|r| fold_text(r))
        .filter(|r| !r.is_empty())
        .collect();
    if recent.is_empty() || max_boost <= 0.0 {
        return;
    }

    for candidate in candidates.iter_mut() {
        let label = candidate.folded_label();
        if label.is_empty() {
            continue;
        }

        let best_overlap = recent
            .iter()
            .filter(|r| label.contains(r.as_str()) || r.contains(label.as_str()))
            .map(|r| r.len().min(label.len()) as f32 / r.len().max(label.len()) as f32)
            .fold(0.0f32, f32::max);

        if best_overlap > 0.0 {
            candidate.score = (candidate.score + max_boost * best_overlap).min(MAX_SCORE);
        }
    }
    sort_by_score(candidates);
}

fn sort_by_score(candidates: &mut [ProductCandidate]) {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
}

/// Gap between the two best scores; `None` with fewer than two candidates
pub fn top_margin(candidates: &[ProductCandidate]) -> Option<f32> {
    match candidates {
        [first, second, ..] => Some((first.score - second.score).max(0.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(brand: &str, name: &str, score: f32) -> ProductCandidate {
        ProductCandidate {
            id: format!("{}-{}", brand, name),
            brand: brand.to_string(),
            name: name.to_string(),
            score,
        }
    }

    fn quality(sharpness: f32, glare: f32, brightness: f32, overall: f32) -> FrameQuality {
        FrameQuality {
            sharpness,
            glare,
            brightness,
            overall,
        }
    }

    fn good_shot() -> ShotAssessment {
        ShotAssessment {
            quality: quality(0.8, 0.1, 0.55, 0.85),
            top_confidence: 0.9,
            margin: Some(0.3),
            packaging: PackagingKind::Can,
            ocr_skipped: false,
            barcode_available: false,
        }
    }

    #[test]
    fn test_confidence_bucket() {
        assert_eq!(confidence_bucket(0.8), ConfidenceBucket::High);
        assert_eq!(confidence_bucket(0.79), ConfidenceBucket::Medium);
        assert_eq!(confidence_bucket(0.2), ConfidenceBucket::Medium);
        assert_eq!(confidence_bucket(0.19), ConfidenceBucket::Low);
    }

    #[test]
    fn test_wrong_but_confident() {
        assert!(is_wrong_but_confident(0.8, 0.5));
        assert!(!is_wrong_but_confident(0.7, 0.5));
        assert!(!is_wrong_but_confident(0.9, 0.55));
    }

    #[test]
    fn test_better_shot_triggers() {
        assert!(better_shot(&good_shot()).is_none());

        let mut shot = good_shot();
        shot.quality.overall = 0.4;
        assert!(needs_better_shot(&shot));

        let mut shot = good_shot();
        shot.top_confidence = 0.5;
        assert!(needs_better_shot(&shot));

        let mut shot = good_shot();
        shot.margin = Some(0.05);
        assert!(needs_better_shot(&shot));
        shot.margin = None;
        assert!(!needs_better_shot(&shot));

        let mut shot = good_shot();
        shot.ocr_skipped = true;
        assert!(needs_better_shot(&shot));
        shot.packaging = PackagingKind::Box;
        assert!(!needs_better_shot(&shot));
    }

    #[test]
    fn test_better_shot_hint_priority() {
        let mut shot = good_shot();
        shot.quality = quality(0.1, 0.7, 0.1, 0.2);
        assert_eq!(better_shot_hint(&shot), BetterShotHint::ReduceGlare);

        shot.quality.glare = 0.2;
        assert_eq!(better_shot_hint(&shot), BetterShotHint::HoldSteady);

        shot.quality.sharpness = 0.5;
        assert_eq!(better_shot_hint(&shot), BetterShotHint::MoreLight);

        shot.quality.brightness = 0.5;
        shot.barcode_available = true;
        assert_eq!(better_shot_hint(&shot), BetterShotHint::ShowBarcode);

        shot.barcode_available = false;
        shot.margin = Some(0.02);
        assert_eq!(better_shot_hint(&shot), BetterShotHint::MoveCloser);

        shot.packaging = PackagingKind::Unknown;
        assert_eq!(better_shot_hint(&shot), BetterShotHint::TryAgain);
        assert!(!BetterShotHint::TryAgain.message().is_empty());
    }

    #[test]
    fn test_front_visibility() {
        let full = VisibilityInput {
            packaging: PackagingKind::Bottle,
            frame_quality: 1.0,
            best_line_score: 1.0,
            ocr_chars: 40,
            top_confidence: 1.0,
            margin: 0.5,
        };
        assert!((front_visibility(&full) - 1.0).abs() < 0.001);

        let half_chars = VisibilityInput {
            ocr_chars: 9,
            margin: 0.09,
            ..full
        };
        // 0.28 + 0.34 + 0.18 * 0.5 + 0.12 + 0.08 * 0.5
        assert!((front_visibility(&half_chars) - 0.87).abs() < 0.001);

        let boxed = VisibilityInput {
            packaging: PackagingKind::Box,
            frame_quality: 0.0,
            best_line_score: 0.0,
            ocr_chars: 0,
            top_confidence: 0.0,
            margin: 0.0,
        };
        assert_eq!(front_visibility(&boxed), 1.0);
    }

    #[test]
    fn test_duplicate_suppression() {
        let mut memory = DuplicateMemory::new(6000);
        assert!(!memory.check_and_record("Pepsi Max", 1000, 0.9));
        assert!(memory.check_and_record("pepsi  max", 4000, 0.9));
        // Poor view is new evidence
        assert!(!memory.check_and_record("Pepsi Max", 5000, 0.3));
        assert!(!memory.check_and_record("Pepsi Max", 12_000, 0.9));
        assert!(!memory.check_and_record("Urge", 12_500, 0.9));

        memory.prune(20_000);
        assert!(!memory.check_and_record("Pepsi Max", 20_500, 0.9));
    }

    #[test]
    fn test_merge_candidates_keeps_best() {
        let merged = merge_candidates(vec![
            candidate("Pepsi", "Max", 0.6),
            candidate("pepsi", "max", 0.8),
            candidate("Urge", "", 0.5),
        ]);
        assert_eq!(merged.len(), 2);
        assert!((merged[0].score - 0.8).abs() < 0.001);
        assert_eq!(merged[1].label(), "Urge");
    }

    #[test]
    fn test_text_ties() {
        let tokens: HashSet<String> = ["pepsi", "max", "pepsi max"].iter().map(|s| s.to_string()).collect();
        assert!((text_tie_boost("Pepsi Max", &tokens) - 0.1).abs() < 0.001);
        assert_eq!(text_tie_boost("Urge", &tokens), 0.0);
        assert_eq!(text_tie_boost("Pepsi", &HashSet::new()), 0.0);

        let mut candidates = vec![candidate("Urge", "", 0.7), candidate("Pepsi", "Max", 0.65)];
        apply_text_ties(&mut candidates, &tokens);
        assert_eq!(candidates[0].brand, "Pepsi");
        assert!((candidates[0].score - 0.75).abs() < 0.001);

        let mut capped = vec![candidate("Pepsi", "Max", 0.95)];
        apply_text_ties(&mut capped, &tokens);
        assert!((capped[0].score - 0.99).abs() < 0.001);
    }

    #[test]
    fn test_rerank_recent() {
        let mut candidates = vec![
            candidate("Coca-Cola", "Original", 0.70),
            candidate("Pepsi", "Max", 0.68),
        ];
        rerank_recent(&mut candidates, &["Pepsi Max".to_string()], 0.04);
        assert_eq!(candidates[0].brand, "Pepsi");
        assert!((candidates[0].score - 0.72).abs() < 0.001);
        assert!((candidates[1].score - 0.70).abs() < 0.001);

        // Partial containment gets a partial boost
        let mut candidates = vec![candidate("Pepsi", "Max Lime", 0.5)];
        rerank_recent(&mut candidates, &["pepsi max".to_string()], 0.04);
        assert!(candidates[0].score > 0.5 && candidates[0].score < 0.54);

        let mut capped = vec![candidate("Pepsi", "Max", 0.98)];
        rerank_recent(&mut capped, &["Pepsi Max".to_string()], 0.04);
        assert!((capped[0].score - 0.99).abs() < 0.001);
    }

    #[test]
    fn test_top_margin() {
        assert_eq!(top_margin(&[]), None);
        assert_eq!(top_margin(&[candidate("a", "b", 0.5)]), None);
        let margin = top_margin(&[candidate("a", "b", 0.8), candidate("c", "d", 0.6)]).unwrap();
        assert!((margin - 0.2).abs() < 0.001);
    }
}
