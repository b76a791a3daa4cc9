//! Multi-frame OCR sample fusion
//!
//! Groups the readings captured over a short window by text similarity and
//! picks the best-supported group as the fused hypothesis. The history
//! tracks how long that hypothesis has held, which is what the commit gate
//! looks at.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::gate::CommitDecisionInput;
use super::text::compact_text;

/// Default grouping threshold for [`text_similarity`]
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.78;

/// Sample quality weights (detection, crop, OCR)
const WEIGHT_DET: f32 = 0.2;
const WEIGHT_CROP: f32 = 0.35;
const WEIGHT_OCR: f32 = 0.45;

/// Share of fused confidence carried by the best member alone
const BEST_MEMBER_SHARE: f32 = 0.65;
/// Bonus per corroborating member
const SUPPORT_BONUS: f32 = 0.04;
/// Members beyond this do not add support bonus
const SUPPORT_CAP: usize = 4;
const MAX_FUSED_CONF: f32 = 0.99;

/// How a sample's text was obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    /// Read directly by the OCR engine
    #[default]
    Raw,
    /// Recovered by brand fragment matching of a weak reading
    Rescued,
}

/// One reading from one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrSample {
    pub timestamp_ms: u64,
    pub text: String,
    /// Detection score of the object the text came from
    pub det_score: f32,
    /// Crop sharpness / glare score
    pub crop_score: f32,
    /// OCR line confidence
    pub ocr_conf: f32,
    pub source: SampleSource,
}

impl OcrSample {
    /// Blend of the three per-sample scores
    pub fn quality(&self) -> f32 {
        (WEIGHT_DET * self.det_score.clamp(0.0, 1.0)
            + WEIGHT_CROP * self.crop_score.clamp(0.0, 1.0)
            + WEIGHT_OCR * self.ocr_conf.clamp(0.0, 1.0))
        .clamp(0.0, 1.0)
    }

    /// Fusion weight; squared so poor crops contribute much less
    fn weight(&self) -> f32 {
        let q = self.quality();
        q * q
    }
}

/// Best hypothesis over the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub text: String,
    pub conf: f32,
    pub source: SampleSource,
    /// Raw members in the winning group
    pub raw_support: usize,
    /// Rescued members in the winning group
    pub rescued_support: usize,
    /// Timestamp of the newest member of the winning group
    #[serde(default)]
    pub newest_ms: u64,
}

/// Similarity in [0, 1] ignoring case and whitespace
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let a: String = a.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    let b: String = b.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    strsim::normalized_levenshtein(&a, &b) as f32
}

/// Groups samples and scores the winning group
#[derive(Debug, Clone)]
pub struct SampleFusionEngine {
    similarity_threshold: f32,
}

impl Default for SampleFusionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl SampleFusionEngine {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            similarity_threshold: similarity_threshold.clamp(0.0, 1.0),
        }
    }

    /// Fuse `samples` into one hypothesis; `None` when there is nothing to fuse
    pub fn fuse<'a, I>(&self, samples: I) -> Option<FusedResult>
    where
        I: IntoIterator<Item = &'a OcrSample>,
    {
        let samples: Vec<&OcrSample> = samples
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .collect();
        if samples.is_empty() {
            return None;
        }

        let groups = self.group(&samples);
        let total_weight: f32 = samples.iter().map(|s| s.weight()).sum();

        let (winner, winner_weight) = groups
            .iter()
            .map(|g| (g, g.iter().map(|s| s.weight()).sum::<f32>()))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        let representative = winner
            .iter()
            .max_by(|a, b| a.ocr_conf.total_cmp(&b.ocr_conf))?;

        let share = if total_weight > 0.0 {
            winner_weight / total_weight
        } else {
            1.0 / groups.len() as f32
        };
        let best = representative.ocr_conf.clamp(0.0, 1.0);
        let support = winner.len().min(SUPPORT_CAP) - 1;
        let conf = best * (BEST_MEMBER_SHARE + (1.0 - BEST_MEMBER_SHARE) * share)
            + SUPPORT_BONUS * support as f32;

        let rescued_support = winner
            .iter()
            .filter(|s| s.source == SampleSource::Rescued)
            .count();
        let raw_support = winner.len() - rescued_support;
        let source = if raw_support == 0 {
            SampleSource::Rescued
        } else {
            SampleSource::Raw
        };

        let fused = FusedResult {
            text: representative.text.clone(),
            conf: conf.clamp(0.0, MAX_FUSED_CONF),
            source,
            raw_support,
            rescued_support,
            newest_ms: winner.iter().map(|s| s.timestamp_ms).max().unwrap_or(0),
        };
        debug!(
            "Fused {:?} (conf {:.3}, {} of {} samples, {} groups)",
            fused.text,
            fused.conf,
            winner.len(),
            samples.len(),
            groups.len()
        );
        Some(fused)
    }

    /// Complete-linkage grouping: a sample joins the first group it is
    /// similar to every member of
    fn group<'a>(&self, samples: &[&'a OcrSample]) -> Vec<Vec<&'a OcrSample>> {
        let mut groups: Vec<Vec<&OcrSample>> = Vec::new();
        for &sample in samples {
            let slot = groups.iter_mut().find(|g| {
                g.iter()
                    .all(|m| text_similarity(&m.text, &sample.text) >= self.similarity_threshold)
            });
            match slot {
                Some(group) => group.push(sample),
                None => groups.push(vec![sample]),
            }
        }
        groups
    }
}

/// Rolling window of recent samples, evicted by age
#[derive(Debug, Clone, Default)]
pub struct SampleWindow {
    samples: VecDeque<OcrSample>,
}

impl SampleWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: OcrSample) {
        self.samples.push_back(sample);
    }

    /// Drop samples older than `window_ms` relative to `now_ms`
    pub fn evict_older_than(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.samples.retain(|s| s.timestamp_ms >= cutoff);
    }

    pub fn iter(&self) -> impl Iterator<Item = &OcrSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Stability of the fused hypothesis across fusion rounds
#[derive(Debug, Clone, Default)]
pub struct FusionHistory {
    key: Option<String>,
    stable_count: u32,
    since_ms: u64,
    last_ms: u64,
}

impl FusionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fusion round backed by a new sample and build the gate
    /// input for it
    pub fn observe(&mut self, fused: &FusedResult, now_ms: u64) -> CommitDecisionInput {
        let key = compact_text(&fused.text);
        if self.key.as_deref() == Some(key.as_str()) {
            self.stable_count = self.stable_count.saturating_add(1);
        } else {
            self.key = Some(key);
            self.stable_count = 1;
            self.since_ms = now_ms;
        }
        self.last_ms = now_ms;

        decision_input(fused, self.stable_count, now_ms.saturating_sub(self.since_ms))
    }

    /// Gate input for a round that brought no new evidence for `fused`.
    /// Stability stays where the last observed round left it; a hypothesis
    /// the history has not seen starts from zero.
    pub fn hold(&self, fused: &FusedResult) -> CommitDecisionInput {
        let key = compact_text(&fused.text);
        if self.key.as_deref() == Some(key.as_str()) {
            decision_input(fused, self.stable_count, self.last_ms.saturating_sub(self.since_ms))
        } else {
            decision_input(fused, 0, 0)
        }
    }

    /// Consecutive rounds the current hypothesis has held
    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    /// Forget the current hypothesis (e.g. after a commit)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn decision_input(fused: &FusedResult, stable_count: u32, continuity_ms: u64) -> CommitDecisionInput {
    let rescued = fused.source == SampleSource::Rescued;
    CommitDecisionInput {
        fused_text: fused.text.clone(),
        fused_conf: fused.conf,
        stable_count,
        continuity_ms,
        fused_source: fused.source,
        rescue_brand: rescued.then(|| fused.text.clone()),
        rescued_hit_count: fused.rescued_support as u32,
        raw_support_count: fused.raw_support as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(text: &str, t: u64, det: f32, crop: f32, ocr: f32, source: SampleSource) -> OcrSample {
        OcrSample {
            timestamp_ms: t,
            text: text.to_string(),
            det_score: det,
            crop_score: crop,
            ocr_conf: ocr,
            source,
        }
    }

    #[test]
    fn test_text_similarity() {
        assert!(text_similarity("Pepsi Max", "pepsimax") >= 0.95);
        assert!(text_similarity("  COCA cola ", "coca cola") >= 0.95);
        assert!(text_similarity("fanta", "urge") < 0.3);
        assert!(text_similarity("cat", "dog") < 0.3);
        assert!((text_similarity("hello", "hallo") - 0.8).abs() < 0.001);
        assert_eq!(text_similarity("", ""), 1.0);
        assert_eq!(text_similarity("pepsi", ""), 0.0);
    }

    #[test]
    fn test_corroborated_reading_wins() {
        let engine = SampleFusionEngine::default();
        let samples = vec![
            sample("Pepsi Max", 0, 0.9, 0.9, 0.9, SampleSource::Raw),
            sample("pepsi max", 100, 0.9, 0.85, 0.88, SampleSource::Raw),
            sample("Pepsi Mix Lime", 200, 0.9, 0.3, 0.92, SampleSource::Raw),
        ];

        let fused = engine.fuse(&samples).unwrap();
        assert_eq!(fused.text, "Pepsi Max");
        assert!(fused.conf > 0.8);
        assert_eq!(fused.source, SampleSource::Raw);
        assert_eq!(fused.raw_support, 2);
    }

    #[test]
    fn test_sharp_sample_outweighs_glared_one() {
        let engine = SampleFusionEngine::default();
        let samples = vec![
            sample("urge", 0, 0.8, 0.2, 0.6, SampleSource::Raw),
            sample("fanta", 50, 0.8, 0.9, 0.6, SampleSource::Raw),
        ];
        assert_eq!(engine.fuse(&samples).unwrap().text, "fanta");
    }

    #[test]
    fn test_source_is_raw_with_any_raw_member() {
        let engine = SampleFusionEngine::default();
        let mixed = vec![
            sample("Solo", 0, 0.8, 0.8, 0.5, SampleSource::Rescued),
            sample("solo", 10, 0.8, 0.8, 0.7, SampleSource::Raw),
        ];
        let fused = engine.fuse(&mixed).unwrap();
        assert_eq!(fused.source, SampleSource::Raw);
        assert_eq!(fused.rescued_support, 1);
        assert_eq!(fused.raw_support, 1);

        let rescued_only = vec![sample("Solo", 0, 0.8, 0.8, 0.5, SampleSource::Rescued)];
        assert_eq!(engine.fuse(&rescued_only).unwrap().source, SampleSource::Rescued);
    }

    #[test]
    fn test_fuse_empty() {
        let engine = SampleFusionEngine::default();
        assert!(engine.fuse(&[]).is_none());
        assert!(engine.fuse(&[sample("  ", 0, 1.0, 1.0, 1.0, SampleSource::Raw)]).is_none());
    }

    #[test]
    fn test_confidence_is_capped() {
        let engine = SampleFusionEngine::default();
        let samples: Vec<OcrSample> = (0..6)
            .map(|i| sample("monster", i * 10, 1.0, 1.0, 1.0, SampleSource::Raw))
            .collect();
        assert!((engine.fuse(&samples).unwrap().conf - 0.99).abs() < 0.001);
    }

    #[test]
    fn test_window_eviction() {
        let mut window = SampleWindow::new();
        window.push(sample("a", 0, 1.0, 1.0, 1.0, SampleSource::Raw));
        window.push(sample("b", 2000, 1.0, 1.0, 1.0, SampleSource::Raw));
        window.push(sample("c", 3000, 1.0, 1.0, 1.0, SampleSource::Raw));

        window.evict_older_than(3000, 2500);
        assert_eq!(window.len(), 2);
        assert_eq!(window.iter().next().unwrap().text, "b");
    }

    #[test]
    fn test_history_tracks_stability() {
        let mut history = FusionHistory::new();
        let fused = |text: &str| FusedResult {
            text: text.to_string(),
            conf: 0.9,
            source: SampleSource::Raw,
            raw_support: 1,
            rescued_support: 0,
            newest_ms: 0,
        };

        let first = history.observe(&fused("Pepsi Max"), 1000);
        assert_eq!(first.stable_count, 1);
        assert_eq!(first.continuity_ms, 0);

        history.observe(&fused("pepsi max"), 1250);
        let third = history.observe(&fused("PEPSI MAX"), 1600);
        assert_eq!(third.stable_count, 3);
        assert_eq!(third.continuity_ms, 600);
        assert!(third.rescue_brand.is_none());

        let changed = history.observe(&fused("Urge"), 1700);
        assert_eq!(changed.stable_count, 1);
        assert_eq!(changed.continuity_ms, 0);
    }

    #[test]
    fn test_hold_keeps_stability_without_new_evidence() {
        let mut history = FusionHistory::new();
        let fused = FusedResult {
            text: "pepsi max".to_string(),
            conf: 0.95,
            source: SampleSource::Raw,
            raw_support: 1,
            rescued_support: 0,
            newest_ms: 0,
        };

        history.observe(&fused, 0);
        let held = history.hold(&fused);
        assert_eq!(held.stable_count, 1);
        assert_eq!(held.continuity_ms, 0);
        assert_eq!(history.stable_count(), 1);

        let other = FusedResult {
            text: "urge".to_string(),
            ..fused.clone()
        };
        assert_eq!(history.hold(&other).stable_count, 0);

        let second = history.observe(&fused, 700);
        assert_eq!(second.stable_count, 2);
        assert_eq!(second.continuity_ms, 700);
    }

    #[test]
    fn test_fused_result_reports_newest_member() {
        let engine = SampleFusionEngine::default();
        let samples = vec![
            sample("Pepsi Max", 0, 1.0, 0.9, 0.9, SampleSource::Raw),
            sample("Pepsi Max", 300, 1.0, 0.9, 0.9, SampleSource::Raw),
            sample("Urge", 600, 0.2, 0.2, 0.3, SampleSource::Raw),
        ];
        let fused = engine.fuse(&samples).unwrap();
        assert_eq!(fused.text, "Pepsi Max");
        assert_eq!(fused.newest_ms, 300);
    }
}
