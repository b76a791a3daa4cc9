//! Commit gate
//!
//! Decides whether a fused hypothesis is final. Pure function over the
//! evidence bundle; the caller keeps sampling while it returns false.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fusion::SampleSource;
use crate::config::GateSettings;

/// Never commit on fewer stable rounds than this
pub const MIN_STABLE_COUNT: u32 = 3;

/// Evidence the gate evaluates, derived from the fusion history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitDecisionInput {
    pub fused_text: String,
    pub fused_conf: f32,
    /// Consecutive fusion rounds with the same text
    pub stable_count: u32,
    /// Wall-clock time the same text has persisted
    pub continuity_ms: u64,
    pub fused_source: SampleSource,
    pub rescue_brand: Option<String>,
    pub rescued_hit_count: u32,
    pub raw_support_count: u32,
}

/// Gate with the default thresholds
pub fn should_commit(input: &CommitDecisionInput) -> bool {
    should_commit_with(input, &GateSettings::default())
}

/// Gate with configured thresholds; the stable count floor still applies
pub fn should_commit_with(input: &CommitDecisionInput, settings: &GateSettings) -> bool {
    let min_stable = settings.min_stable_count.max(MIN_STABLE_COUNT);

    if input.fused_text.trim().is_empty() || input.fused_conf.is_nan() {
        return false;
    }

    let confident = input.fused_conf >= settings.min_confidence;
    let stable = input.stable_count >= min_stable;
    let continuous = input.continuity_ms >= settings.min_continuity_ms;
    let corroborated = match input.fused_source {
        SampleSource::Raw => true,
        SampleSource::Rescued => input.rescued_hit_count >= 2 || input.raw_support_count >= 1,
    };

    let commit = confident && stable && continuous && corroborated;
    debug!(
        "Gate {:?}: conf={:.3} stable={} continuity={}ms corroborated={} -> {}",
        input.fused_text, input.fused_conf, input.stable_count, input.continuity_ms, corroborated, commit
    );
    commit
}
