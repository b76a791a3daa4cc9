//! Scan session
//!
//! A session owns everything that lives for one camera session: the OCR
//! engine, the fusion window and history, tracking state, the result cache
//! and the resolver. Dropping the session drops all of it.

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::heuristics::ProductCandidate;
use super::tracking::{BoundingBox, TrackUpdate, Tracker};
use super::{ProductSearch, RecentActivity, ResolveError, ResolveOutcome, ResolveRequest, Resolver};
use crate::analysis::brands::{is_weak_sample, resolve_brands_in_lines, BrandBoostHit};
use crate::analysis::fusion::{FusedResult, FusionHistory, OcrSample, SampleFusionEngine, SampleSource, SampleWindow};
use crate::analysis::gate::{should_commit_with, CommitDecisionInput};
use crate::analysis::text::{extract_seeds, extract_text_tokens, is_noise_seed, line_score, normalize_text, SeedCandidate};
use crate::capture::{CapturedFrame, PackagingKind};
use crate::config::{AppConfig, PreprocessPreset};
use crate::vision::{assess_frame, preprocess_frame, preprocess_frame_with, FrameQuality, OcrEngine, OcrError, OcrLine, OcrRequest, TextRecognizer};

/// Earlier rescues of the same brand needed for full rescued confidence
const RESCUE_FULL_SUPPORT: usize = 2;
/// Rescued confidence ceiling on a frame of zero quality
const RESCUE_CONF_BASE: f32 = 0.6;
/// Added to the ceiling per unit of frame quality
const RESCUE_CONF_QUALITY: f32 = 0.35;

/// Results cached for one captured image
#[derive(Debug, Clone, Default)]
struct CacheEntry {
    best: Option<ProductCandidate>,
    by_seed: HashMap<String, ProductCandidate>,
}

/// Per-image result cache, bounded FIFO by image
#[derive(Debug, Clone)]
pub struct SessionCache {
    max_images: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl SessionCache {
    pub fn new(max_images: usize) -> Self {
        Self {
            max_images: max_images.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get_best(&self, image_hash: &str) -> Option<&ProductCandidate> {
        self.entries.get(image_hash)?.best.as_ref()
    }

    pub fn set_best(&mut self, image_hash: &str, item: ProductCandidate) {
        self.entry(image_hash).best = Some(item);
    }

    pub fn get_seed(&self, image_hash: &str, seed: &str) -> Option<&ProductCandidate> {
        self.entries.get(image_hash)?.by_seed.get(&seed_key(seed))
    }

    pub fn set_seed(&mut self, image_hash: &str, seed: &str, item: ProductCandidate) {
        self.entry(image_hash).by_seed.insert(seed_key(seed), item);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&mut self, image_hash: &str) -> &mut CacheEntry {
        if !self.entries.contains_key(image_hash) {
            while self.order.len() >= self.max_images {
                match self.order.pop_front() {
                    Some(oldest) => {
                        debug!("Evicting cached image {}", oldest);
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.order.push_back(image_hash.to_string());
        }
        self.entries.entry(image_hash.to_string()).or_default()
    }
}

fn seed_key(seed: &str) -> String {
    seed.trim().to_lowercase()
}

/// What the camera layer knows about a frame
#[derive(Debug, Clone, Default)]
pub struct FrameHints {
    pub packaging: PackagingKind,
    /// Detector score for the package; 1.0 when there is no detector
    pub det_score: Option<f32>,
    /// Tracked object id and its box
    pub track: Option<(String, BoundingBox)>,
}

/// Everything one frame produced
#[derive(Debug, Clone, Serialize)]
pub struct FrameOutcome {
    pub timestamp_ms: u64,
    pub quality: FrameQuality,
    pub lines: Vec<OcrLine>,
    /// Whether the aggressive preset was used for a second pass
    pub retried: bool,
    pub best_line_score: f32,
    pub sample: Option<OcrSample>,
    pub fused: Option<FusedResult>,
    pub decision_input: Option<CommitDecisionInput>,
    pub committed: bool,
    pub seeds: Vec<SeedCandidate>,
    pub brand_hits: Vec<BrandBoostHit>,
    /// Brand seeds first, then line seeds
    pub search_seeds: Vec<SeedCandidate>,
    pub tracking: Option<TrackUpdate>,
    #[serde(skip)]
    pub text_tokens: HashSet<String>,
}

impl FrameOutcome {
    /// Letters read on this frame
    pub fn ocr_chars(&self) -> usize {
        count_letters(&self.lines)
    }
}

/// One camera session
pub struct ScanSession<E: OcrEngine> {
    id: Uuid,
    config: AppConfig,
    recognizer: TextRecognizer<E>,
    fusion: SampleFusionEngine,
    window: SampleWindow,
    history: FusionHistory,
    tracker: Tracker,
    resolver: Resolver,
    shutdown: CancellationToken,
}

impl<E: OcrEngine> ScanSession<E> {
    /// Start a session; `engine_factory` runs on the first OCR call
    pub fn new<F>(config: AppConfig, engine_factory: F) -> Self
    where
        F: Fn() -> Result<E, OcrError> + Send + Sync + 'static,
    {
        let config = config.normalized();
        let id = Uuid::new_v4();
        info!("Scan session {} started", id);

        Self {
            id,
            fusion: SampleFusionEngine::new(config.fusion.similarity_threshold),
            window: SampleWindow::new(),
            history: FusionHistory::new(),
            tracker: Tracker::new(config.resolver.tracking_lost_continuity),
            resolver: Resolver::new(config.resolver.clone()),
            recognizer: TextRecognizer::new(engine_factory),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Run one frame through OCR, seeding, brand matching, fusion and the gate
    pub async fn process_frame(&mut self, frame: &CapturedFrame, hints: &FrameHints) -> Result<FrameOutcome, OcrError> {
        let now = frame.timestamp_ms;
        let quality = assess_frame(frame);
        let request = OcrRequest::from_settings(&self.config.ocr);

        let first_pass = preprocess_frame_with(frame, &self.config.preprocess.first_pass());
        let mut lines = self
            .recognizer
            .recognize_lines(&first_pass, &request, &self.shutdown)
            .await?;

        let mut retried = false;
        let min_chars = self.config.ocr.min_text_chars_before_retry;
        if count_letters(&lines) < min_chars && self.config.preprocess.preset != PreprocessPreset::Aggressive {
            debug!("Only {} letters read, retrying with aggressive preset", count_letters(&lines));
            let second_pass = preprocess_frame(frame, PreprocessPreset::Aggressive);
            let retry_lines = self
                .recognizer
                .recognize_lines(&second_pass, &request, &self.shutdown)
                .await?;
            retried = true;
            if count_letters(&retry_lines) > count_letters(&lines) {
                lines = retry_lines;
            }
        }

        let scored: Vec<(String, f32, f32)> = lines
            .iter()
            .map(|l| {
                let normalized = normalize_text(&l.text);
                let score = line_score(&normalized, l.confidence);
                (normalized, score, l.confidence)
            })
            .filter(|(text, _, _)| !text.is_empty())
            .collect();
        let best_line = scored
            .iter()
            .filter(|(text, _, _)| !is_noise_seed(text))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        let best_line_score = best_line.map_or(0.0, |l| l.1);

        let seeds = extract_seeds(&lines, self.config.seeds.max_seeds);
        let brands = resolve_brands_in_lines(scored.iter().map(|(text, score, _)| (text.as_str(), *score)));
        let text_tokens = extract_text_tokens(&lines);

        self.window.evict_older_than(now, self.config.fusion.window_ms);
        let det_score = hints.det_score.unwrap_or(1.0);
        let rescue = brands.hits.iter().find(|h| h.rescued);
        let rescued_sample = |hit: &BrandBoostHit| {
            let earlier = self
                .window
                .iter()
                .filter(|s| s.source == SampleSource::Rescued && s.text == hit.canonical)
                .count();
            OcrSample {
                timestamp_ms: now,
                text: hit.canonical.clone(),
                det_score,
                crop_score: quality.overall,
                ocr_conf: rescued_confidence(hit.score, quality.overall, earlier),
                source: SampleSource::Rescued,
            }
        };
        let sample = match (best_line, rescue) {
            (Some((text, score, _)), Some(hit)) if is_weak_sample(*score, text) => Some(rescued_sample(hit)),
            (Some((text, _, conf)), _) => Some(OcrSample {
                timestamp_ms: now,
                text: text.clone(),
                det_score,
                crop_score: quality.overall,
                ocr_conf: *conf,
                source: SampleSource::Raw,
            }),
            // Only garbled lines, but a brand could still be recovered from them
            (None, Some(hit)) => Some(rescued_sample(hit)),
            (None, None) => None,
        };

        if let Some(sample) = &sample {
            self.window.push(sample.clone());
        }

        let fused = self.fusion.fuse(self.window.iter());
        // Stability only advances when this frame's sample backs the winner
        let advanced = sample.is_some() && fused.as_ref().is_some_and(|f| f.newest_ms == now);
        let decision_input = fused.as_ref().map(|f| {
            if advanced {
                self.history.observe(f, now)
            } else {
                self.history.hold(f)
            }
        });
        let committed = advanced
            && decision_input
                .as_ref()
                .is_some_and(|input| should_commit_with(input, &self.config.gate));
        if committed {
            info!("Committed {:?}", fused.as_ref().map(|f| &f.text));
            self.history.reset();
            self.window.clear();
        }

        let tracking = hints.track.as_ref().map(|(id, bbox)| {
            let confidence = fused.as_ref().map_or(0.0, |f| f.conf);
            self.tracker.update(id, *bbox, quality.overall, confidence)
        });

        let search_seeds = combine_seeds(&brands.boosted_seeds, brands.best().map_or(0.0, |h| h.score), &seeds, self.config.seeds.max_seeds);

        Ok(FrameOutcome {
            timestamp_ms: now,
            quality,
            lines,
            retried,
            best_line_score,
            sample,
            fused,
            decision_input,
            committed,
            seeds,
            brand_hits: brands.hits,
            search_seeds,
            tracking,
            text_tokens,
        })
    }

    /// Resolve a processed frame against product search
    pub async fn resolve(
        &self,
        frame: &CapturedFrame,
        outcome: &FrameOutcome,
        hints: &FrameHints,
        search: &dyn ProductSearch,
        recent: &dyn RecentActivity,
    ) -> Result<Option<ResolveOutcome>, ResolveError> {
        let request = ResolveRequest {
            image_hash: frame.image_hash(),
            seeds: outcome.search_seeds.clone(),
            text_tokens: outcome.text_tokens.clone(),
            quality: outcome.quality,
            packaging: hints.packaging,
            best_line_score: outcome.best_line_score,
            ocr_chars: outcome.ocr_chars(),
            ocr_skipped: outcome.lines.is_empty(),
            barcode_available: false,
            now_ms: outcome.timestamp_ms,
        };
        self.resolver.resolve(request, search, recent).await
    }

    /// End the session: cancels in-flight OCR and resolution
    pub fn close(&self) {
        self.shutdown.cancel();
        self.resolver.cancel();
        info!("Scan session {} closed", self.id);
    }
}

/// Confidence of a rescued reading. A first rescue keeps the fragment
/// match score; repeats of the same brand move it towards what the frame
/// quality supports, reaching it after [`RESCUE_FULL_SUPPORT`] earlier rescues.
fn rescued_confidence(hit_score: f32, frame_quality: f32, earlier_rescues: usize) -> f32 {
    let target = RESCUE_CONF_BASE + RESCUE_CONF_QUALITY * frame_quality.clamp(0.0, 1.0);
    let corroboration = earlier_rescues.min(RESCUE_FULL_SUPPORT) as f32 / RESCUE_FULL_SUPPORT as f32;
    let hit_score = hit_score.clamp(0.0, 1.0);
    hit_score + (target - hit_score).max(0.0) * corroboration
}

fn count_letters(lines: &[OcrLine]) -> usize {
    lines
        .iter()
        .map(|l| l.text.chars().filter(|c| c.is_alphabetic()).count())
        .sum()
}

/// Brand seeds (scored as the best brand hit) ahead of line seeds,
/// deduplicated case-insensitively
fn combine_seeds(brand_seeds: &[String], brand_score: f32, line_seeds: &[SeedCandidate], max_seeds: usize) -> Vec<SeedCandidate> {
    let mut seen = HashSet::new();
    brand_seeds
        .iter()
        .map(|text| SeedCandidate {
            text: text.clone(),
            score: brand_score,
        })
        .chain(line_seeds.iter().cloned())
        .filter(|seed| seen.insert(seed.text.trim().to_lowercase()))
        .take(max_seeds)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{EngineLine, OcrLanguage, OcrParams};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn item(name: &str, score: f32) -> ProductCandidate {
        ProductCandidate {
            id: name.to_string(),
            brand: String::new(),
            name: name.to_string(),
            score,
        }
    }

    #[test]
    fn test_cache_is_keyed_by_image() {
        let mut cache = SessionCache::new(8);
        assert!(cache.get_best("a").is_none());

        cache.set_seed("a", "Pepsi", item("pepsi max", 0.9));
        assert!(cache.get_seed("a", "pepsi").is_some());
        assert!(cache.get_seed("b", "pepsi").is_none());
        assert!(cache.get_best("a").is_none());

        cache.set_best("a", item("pepsi max", 0.9));
        assert_eq!(cache.get_best("a").unwrap().name, "pepsi max");
        assert!(cache.get_best("b").is_none());
    }

    #[test]
    fn test_cache_evicts_oldest_image() {
        let mut cache = SessionCache::new(2);
        cache.set_best("a", item("a", 0.5));
        cache.set_best("b", item("b", 0.5));
        cache.set_seed("a", "x", item("a", 0.5));
        cache.set_best("c", item("c", 0.5));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_best("a").is_none());
        assert!(cache.get_best("b").is_some());
        assert!(cache.get_best("c").is_some());
    }

    #[test]
    fn test_combine_seeds() {
        let line_seeds = vec![
            SeedCandidate { text: "pepsi max".to_string(), score: 0.9 },
            SeedCandidate { text: "uten sukker".to_string(), score: 0.6 },
        ];
        let combined = combine_seeds(&["Pepsi".to_string(), "pepsi max".to_string()], 0.95, &line_seeds, 6);
        let texts: Vec<&str> = combined.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Pepsi", "pepsi max", "uten sukker"]);
        assert!((combined[1].score - 0.95).abs() < 0.001);

        assert_eq!(combine_seeds(&[], 0.0, &line_seeds, 1).len(), 1);
    }

    struct ScriptedEngine {
        calls: Arc<AtomicUsize>,
        script: Vec<Vec<EngineLine>>,
    }

    #[async_trait]
    impl OcrEngine for ScriptedEngine {
        async fn load_language(&mut self, _language: OcrLanguage) -> Result<(), OcrError> {
            Ok(())
        }

        async fn set_parameters(&mut self, _params: &OcrParams) -> Result<(), OcrError> {
            Ok(())
        }

        async fn recognize_text(&mut self, _image: &CapturedFrame) -> Result<String, OcrError> {
            Ok(String::new())
        }

        async fn recognize_lines(&mut self, _image: &CapturedFrame) -> Result<Vec<EngineLine>, OcrError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .script
                .get(call)
                .or_else(|| self.script.last())
                .cloned()
                .unwrap_or_default())
        }
    }

    fn session(script: Vec<Vec<EngineLine>>) -> (ScanSession<ScriptedEngine>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let session = ScanSession::new(AppConfig::default(), move || {
            Ok(ScriptedEngine {
                calls: counter.clone(),
                script: script.clone(),
            })
        });
        (session, calls)
    }

    fn engine_line(text: &str, confidence: f32) -> EngineLine {
        EngineLine {
            text: text.to_string(),
            confidence,
        }
    }

    /// Sharp black/white stripes, well exposed
    fn frame(timestamp_ms: u64) -> CapturedFrame {
        let (w, h) = (32u32, 32u32);
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for _y in 0..h {
            for x in 0..w {
                let v = if (x / 2) % 2 == 0 { 30 } else { 200 };
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        CapturedFrame::new(data, w, h, timestamp_ms)
    }

    #[tokio::test]
    async fn test_stable_reading_commits_after_three_rounds() {
        let (mut session, _) = session(vec![vec![engine_line("Pepsi Max", 95.0), engine_line("0,5 l", 80.0)]]);
        let hints = FrameHints::default();

        let first = session.process_frame(&frame(0), &hints).await.unwrap();
        assert_eq!(first.sample.as_ref().unwrap().source, SampleSource::Raw);
        assert_eq!(first.fused.as_ref().unwrap().text, "pepsi max");
        assert!(!first.committed);
        assert_eq!(first.search_seeds[0].text, "Pepsi");
        assert!(first.search_seeds.iter().any(|s| s.text == "pepsi max"));
        assert!(first.brand_hits.iter().any(|h| h.canonical == "Pepsi"));

        let second = session.process_frame(&frame(300), &hints).await.unwrap();
        assert!(!second.committed);

        let third = session.process_frame(&frame(600), &hints).await.unwrap();
        let input = third.decision_input.as_ref().unwrap();
        assert_eq!(input.stable_count, 3);
        assert_eq!(input.continuity_ms, 600);
        assert!(input.fused_conf >= 0.85);
        assert!(third.committed);

        // History restarts after a commit
        let fourth = session.process_frame(&frame(900), &hints).await.unwrap();
        assert!(!fourth.committed);
        assert_eq!(fourth.decision_input.unwrap().stable_count, 1);
    }

    #[tokio::test]
    async fn test_too_little_text_triggers_aggressive_retry() {
        let (mut session, calls) = session(vec![vec![engine_line("x", 40.0)], vec![engine_line("Urge", 88.0)]]);

        let outcome = session.process_frame(&frame(0), &FrameHints::default()).await.unwrap();
        assert!(outcome.retried);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.lines[0].text, "Urge");
    }

    #[tokio::test]
    async fn test_weak_line_becomes_rescued_sample() {
        let (mut session, _) = session(vec![vec![engine_line("fqnta", 30.0)]]);

        let outcome = session.process_frame(&frame(0), &FrameHints::default()).await.unwrap();
        let sample = outcome.sample.unwrap();
        assert_eq!(sample.source, SampleSource::Rescued);
        assert_eq!(sample.text, "Fanta");
        assert_eq!(outcome.fused.unwrap().source, SampleSource::Rescued);
        assert!(!outcome.committed);
    }

    #[tokio::test]
    async fn test_blank_frames_do_not_advance_stability() {
        let (mut session, _) = session(vec![vec![engine_line("Pepsi Max", 95.0)], vec![], vec![]]);
        let hints = FrameHints::default();

        let first = session.process_frame(&frame(0), &hints).await.unwrap();
        assert!(first.sample.is_some());

        for t in [300, 600, 900] {
            let blank = session.process_frame(&frame(t), &hints).await.unwrap();
            assert!(blank.sample.is_none());
            let input = blank.decision_input.as_ref().unwrap();
            assert_eq!(input.stable_count, 1);
            assert_eq!(input.continuity_ms, 0);
            assert!(!blank.committed);
        }
    }

    #[tokio::test]
    async fn test_repeated_rescue_commits() {
        let (mut session, _) = session(vec![vec![engine_line("fqnta", 30.0)]]);
        let hints = FrameHints::default();

        let first = session.process_frame(&frame(0), &hints).await.unwrap();
        let first_conf = first.sample.as_ref().unwrap().ocr_conf;
        assert!(first_conf <= 0.58);
        assert!(!first.committed);

        let second = session.process_frame(&frame(300), &hints).await.unwrap();
        assert!(second.sample.as_ref().unwrap().ocr_conf > first_conf);
        assert!(!second.committed);

        let third = session.process_frame(&frame(600), &hints).await.unwrap();
        let input = third.decision_input.as_ref().unwrap();
        assert_eq!(input.fused_source, SampleSource::Rescued);
        assert_eq!(input.rescued_hit_count, 3);
        assert_eq!(input.raw_support_count, 0);
        assert!(input.fused_conf >= 0.85);
        assert_eq!(input.fused_text, "Fanta");
        assert!(third.committed);
    }

    #[tokio::test]
    async fn test_lone_rescue_never_commits() {
        let (mut session, _) = session(vec![vec![engine_line("fqnta", 30.0)], vec![], vec![]]);
        let hints = FrameHints::default();

        for t in [0, 300, 600, 900, 1200] {
            let outcome = session.process_frame(&frame(t), &hints).await.unwrap();
            assert!(!outcome.committed);
            let input = outcome.decision_input.unwrap();
            assert_eq!(input.rescued_hit_count, 1);
            assert!(input.stable_count <= 1);
        }
    }

    #[tokio::test]
    async fn test_garbled_line_still_yields_rescued_sample() {
        let (mut session, _) = session(vec![vec![engine_line("i m s d a l", 40.0)]]);

        let outcome = session.process_frame(&frame(0), &FrameHints::default()).await.unwrap();
        assert!(outcome.brand_hits.iter().any(|h| h.canonical == "Imsdal" && h.rescued));
        assert_eq!(outcome.best_line_score, 0.0);
        let sample = outcome.sample.unwrap();
        assert_eq!(sample.source, SampleSource::Rescued);
        assert_eq!(sample.text, "Imsdal");
    }

    #[test]
    fn test_rescued_confidence_grows_with_corroboration() {
        assert!((rescued_confidence(0.52, 0.9, 0) - 0.52).abs() < 0.001);
        let half = rescued_confidence(0.52, 0.9, 1);
        let full = rescued_confidence(0.52, 0.9, 2);
        assert!(half > 0.52 && half < full);
        assert!((full - (0.6 + 0.35 * 0.9)).abs() < 0.001);
        assert_eq!(rescued_confidence(0.52, 0.9, 5), full);
        // A bad frame never lowers a rescue below its match score
        assert!((rescued_confidence(0.58, 0.0, 2) - 0.6).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_tracking_follows_hints() {
        let (mut session, _) = session(vec![vec![engine_line("Monster Energy", 90.0)]]);
        let hints = FrameHints {
            packaging: PackagingKind::Can,
            det_score: Some(0.9),
            track: Some(("can".to_string(), BoundingBox::new(0.2, 0.2, 0.4, 0.4))),
        };

        let outcome = session.process_frame(&frame(0), &hints).await.unwrap();
        let tracking = outcome.tracking.unwrap();
        assert!(!tracking.swap_suppressed);
        assert!(tracking.state.smoothed_confidence > 0.0);
    }

    #[tokio::test]
    async fn test_close_cancels_ocr() {
        let (mut session, _) = session(vec![vec![engine_line("Pepsi", 90.0)]]);
        session.close();
        let result = session.process_frame(&frame(0), &FrameHints::default()).await;
        assert!(matches!(result, Err(OcrError::Cancelled)));
    }
}
