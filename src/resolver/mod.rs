//! Product Resolution Layer
//!
//! Turns the seeds of a processed frame into a ranked product match:
//! - per-image result cache
//! - cancellation of superseded resolve runs
//! - candidate merging, OCR text ties and recent-item re-ranking
//! - camera guidance (better shot, front visibility, duplicates)
//!
//! Product search and recent activity are supplied by the host application.

pub mod heuristics;
pub mod run_guard;
pub mod session;
pub mod tracking;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::text::SeedCandidate;
use crate::capture::PackagingKind;
use crate::config::ResolverSettings;
use crate::vision::FrameQuality;

pub use heuristics::{
    apply_text_ties, better_shot, confidence_bucket, front_visibility, is_wrong_but_confident, merge_candidates,
    rerank_recent, top_margin, BetterShotHint, ConfidenceBucket, DuplicateMemory, ProductCandidate, ShotAssessment,
    VisibilityInput,
};
pub use run_guard::{RunGuard, RunTicket};
pub use session::{FrameHints, FrameOutcome, ScanSession, SessionCache};
pub use tracking::{BoundingBox, TrackUpdate, Tracker, TrackingState};

/// Resolution failures
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("resolve run was superseded")]
    Cancelled,
    #[error("product search failed: {0}")]
    Search(#[from] anyhow::Error),
}

/// External product catalog lookup
#[async_trait]
pub trait ProductSearch: Send + Sync {
    /// Ranked candidates for one seed
    async fn search(&self, seed: &str) -> anyhow::Result<Vec<ProductCandidate>>;
}

/// Recently logged items, used for re-ranking
pub trait RecentActivity: Send + Sync {
    fn recent_labels(&self) -> Vec<String>;
}

/// No recent items
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecentActivity;

impl RecentActivity for NoRecentActivity {
    fn recent_labels(&self) -> Vec<String> {
        Vec::new()
    }
}

impl RecentActivity for Vec<String> {
    fn recent_labels(&self) -> Vec<String> {
        self.clone()
    }
}

/// Everything one resolve run needs from the processed frame
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub image_hash: String,
    /// Seeds in search order
    pub seeds: Vec<SeedCandidate>,
    pub text_tokens: HashSet<String>,
    pub quality: FrameQuality,
    pub packaging: PackagingKind,
    pub best_line_score: f32,
    pub ocr_chars: usize,
    pub ocr_skipped: bool,
    pub barcode_available: bool,
    pub now_ms: u64,
}

/// Result of a resolve run that was still current when it finished
#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub run_id: u64,
    pub best: Option<ProductCandidate>,
    pub candidates: Vec<ProductCandidate>,
    pub bucket: ConfidenceBucket,
    pub better_shot: Option<BetterShotHint>,
    pub front_visibility: f32,
    pub suppressed_duplicate: bool,
    pub wrong_but_confident: bool,
    pub from_cache: bool,
}

/// Session-scoped resolver; safe to call from overlapping tasks
pub struct Resolver {
    settings: ResolverSettings,
    guard: RunGuard,
    cache: Mutex<SessionCache>,
    duplicates: Mutex<DuplicateMemory>,
}

impl Resolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self {
            guard: RunGuard::new(),
            cache: Mutex::new(SessionCache::new(settings.cache_max_images)),
            duplicates: Mutex::new(DuplicateMemory::new(settings.duplicate_window_ms)),
            settings,
        }
    }

    /// Resolve `request`, superseding any run still in flight.
    ///
    /// Returns `Ok(None)` when this run was itself superseded before it
    /// finished; stale results never reach the caller.
    pub async fn resolve(
        &self,
        request: ResolveRequest,
        search: &dyn ProductSearch,
        recent: &dyn RecentActivity,
    ) -> Result<Option<ResolveOutcome>, ResolveError> {
        let ticket = self.guard.begin();
        debug!("Resolve run {} with {} seeds", ticket.id, request.seeds.len());

        match self.run(&ticket, &request, search, recent).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(ResolveError::Cancelled) => {
                debug!("Discarding superseded run {}", ticket.id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel the current run, if any
    pub fn cancel(&self) {
        self.guard.cancel_all();
    }

    pub fn is_current(&self, run_id: u64) -> bool {
        self.guard.is_current(run_id)
    }

    async fn run(
        &self,
        ticket: &RunTicket,
        request: &ResolveRequest,
        search: &dyn ProductSearch,
        recent: &dyn RecentActivity,
    ) -> Result<ResolveOutcome, ResolveError> {
        let cached_best = self.cache.lock().get_best(&request.image_hash).cloned();
        if let Some(best) = cached_best {
            debug!("Cache hit for image {}", short_hash(&request.image_hash));
            return self.finish(ticket, request, vec![best], recent, true);
        }

        let mut candidates: Vec<ProductCandidate> = Vec::new();
        let mut last_error = None;

        for seed in &request.seeds {
            let cached = self.cache.lock().get_seed(&request.image_hash, &seed.text).cloned();
            if let Some(item) = cached {
                candidates.push(item);
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = ticket.token.cancelled() => return Err(ResolveError::Cancelled),
                result = search.search(&seed.text) => result,
            };

            match result {
                Ok(mut found) => {
                    found.sort_by(|a, b| b.score.total_cmp(&a.score));
                    if let Some(top) = found.first() {
                        if self.guard.is_current(ticket.id) {
                            self.cache.lock().set_seed(&request.image_hash, &seed.text, top.clone());
                        }
                    }
                    candidates.extend(found);
                }
                Err(e) => {
                    warn!("Product search for {:?} failed: {:#}", seed.text, e);
                    last_error = Some(e);
                }
            }
        }

        if candidates.is_empty() {
            if let Some(e) = last_error {
                return Err(ResolveError::Search(e));
            }
        }

        self.finish(ticket, request, candidates, recent, false)
    }

    /// Rank candidates and apply the guidance heuristics; shared state is
    /// only touched while the run is still current
    fn finish(
        &self,
        ticket: &RunTicket,
        request: &ResolveRequest,
        candidates: Vec<ProductCandidate>,
        recent: &dyn RecentActivity,
        from_cache: bool,
    ) -> Result<ResolveOutcome, ResolveError> {
        let mut candidates = merge_candidates(candidates);
        if !from_cache {
            apply_text_ties(&mut candidates, &request.text_tokens);
            rerank_recent(&mut candidates, &recent.recent_labels(), self.settings.recent_boost);
        }

        let best = candidates.first().cloned();
        let top = best.as_ref().map_or(0.0, |b| b.score);
        let margin = top_margin(&candidates);

        let visibility = front_visibility(&VisibilityInput {
            packaging: request.packaging,
            frame_quality: request.quality.overall,
            best_line_score: request.best_line_score,
            ocr_chars: request.ocr_chars,
            top_confidence: top,
            margin: margin.unwrap_or(0.0),
        });
        let hint = better_shot(&ShotAssessment {
            quality: request.quality,
            top_confidence: top,
            margin,
            packaging: request.packaging,
            ocr_skipped: request.ocr_skipped,
            barcode_available: request.barcode_available,
        });
        let seed_confidence = request.seeds.first().map_or(0.0, |s| s.score);
        let wrong_but_confident = is_wrong_but_confident(seed_confidence, top);

        if !self.guard.is_current(ticket.id) {
            return Err(ResolveError::Cancelled);
        }

        let mut suppressed_duplicate = false;
        if let Some(best) = &best {
            if !from_cache {
                self.cache.lock().set_best(&request.image_hash, best.clone());
            }
            let mut duplicates = self.duplicates.lock();
            duplicates.prune(request.now_ms);
            suppressed_duplicate = duplicates.check_and_record(&best.label(), request.now_ms, visibility);
            drop(duplicates);
            info!(
                "Resolved {:?} (score {:.3}, {} candidates)",
                best.label(),
                best.score,
                candidates.len()
            );
        }

        Ok(ResolveOutcome {
            run_id: ticket.id,
            best,
            bucket: confidence_bucket(top),
            candidates,
            better_shot: hint,
            front_visibility: visibility,
            suppressed_duplicate,
            wrong_but_confident,
            from_cache,
        })
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
