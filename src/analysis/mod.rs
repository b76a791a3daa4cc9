//! Text Analysis Layer
//!
//! Turns OCR lines into something a product search can use:
//! - normalization, noise filtering and seed ranking
//! - brand rescue matching and seed expansion
//! - multi-frame fusion of readings
//! - the commit gate

pub mod brands;
pub mod fusion;
pub mod gate;
pub mod text;

pub use brands::{resolve_brands, BrandBoostHit, BrandResolution};
pub use fusion::{FusedResult, FusionHistory, OcrSample, SampleFusionEngine, SampleSource, SampleWindow};
pub use gate::{should_commit, should_commit_with, CommitDecisionInput};
pub use text::{extract_seeds, extract_text_tokens, line_score, normalize_text, SeedCandidate};
