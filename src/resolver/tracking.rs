//! Frame-to-frame tracking continuity
//!
//! Decides whether consecutive detections are the same physical package
//! and smooths its confidence over time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Center distance (normalized) at which distance continuity reaches 0
const CONTINUITY_DISTANCE: f32 = 0.36;
const IOU_WEIGHT: f32 = 0.7;
const DISTANCE_WEIGHT: f32 = 0.3;

const SWAP_MAX_IOU: f32 = 0.05;
const SWAP_MIN_DISTANCE: f32 = 0.43;
const SWAP_MAX_QUALITY: f32 = 0.78;

const ALPHA_BASE: f32 = 0.12;
const ALPHA_QUALITY: f32 = 0.25;
const ALPHA_CONTINUITY: f32 = 0.15;

/// Continuity below which a track is dropped by default
pub const DEFAULT_LOST_CONTINUITY: f32 = 0.15;

/// Axis-aligned box in normalized frame coordinates (0.0 - 1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection over union
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Euclidean distance between centers
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// 0.7 x IoU + 0.3 x distance continuity
pub fn continuity(iou: f32, center_dist: f32) -> f32 {
    let distance_continuity = (1.0 - center_dist / CONTINUITY_DISTANCE).clamp(0.0, 1.0);
    (IOU_WEIGHT * iou.clamp(0.0, 1.0) + DISTANCE_WEIGHT * distance_continuity).clamp(0.0, 1.0)
}

/// A far, non-overlapping, poor-quality detection is more likely a
/// different object than the tracked one moving
pub fn suppress_swap(iou: f32, center_dist: f32, quality: f32) -> bool {
    iou < SWAP_MAX_IOU && center_dist > SWAP_MIN_DISTANCE && quality < SWAP_MAX_QUALITY
}

/// Smoothing factor for the confidence EMA
pub fn smoothing_alpha(quality: f32, continuity: f32) -> f32 {
    ALPHA_BASE + ALPHA_QUALITY * quality.clamp(0.0, 1.0) + ALPHA_CONTINUITY * continuity.clamp(0.0, 1.0)
}

/// Per-object tracking state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackingState {
    pub iou: f32,
    pub center_dist: f32,
    pub quality: f32,
    pub smoothed_confidence: f32,
}

/// Result of feeding one detection to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackUpdate {
    pub state: TrackingState,
    pub continuity: f32,
    /// The detection was ignored as a likely different object
    pub swap_suppressed: bool,
    /// The previous track was dropped and restarted from this detection
    pub restarted: bool,
}

#[derive(Debug, Clone)]
struct Track {
    bbox: BoundingBox,
    state: TrackingState,
}

/// Tracks keyed by caller-assigned id, owned by one scan session
#[derive(Debug, Clone)]
pub struct Tracker {
    lost_continuity: f32,
    tracks: HashMap<String, Track>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOST_CONTINUITY)
    }
}

impl Tracker {
    pub fn new(lost_continuity: f32) -> Self {
        Self {
            lost_continuity,
            tracks: HashMap::new(),
        }
    }

    /// Feed a detection for `track_id`
    pub fn update(&mut self, track_id: &str, bbox: BoundingBox, quality: f32, confidence: f32) -> TrackUpdate {
        let fresh = TrackingState {
            iou: 1.0,
            center_dist: 0.0,
            quality,
            smoothed_confidence: confidence,
        };

        let Some(track) = self.tracks.get_mut(track_id) else {
            self.tracks.insert(track_id.to_string(), Track { bbox, state: fresh });
            return TrackUpdate {
                state: fresh,
                continuity: 1.0,
                swap_suppressed: false,
                restarted: false,
            };
        };

        let iou = track.bbox.iou(&bbox);
        let center_dist = track.bbox.center_distance(&bbox);
        let score = continuity(iou, center_dist);

        if suppress_swap(iou, center_dist, quality) {
            debug!("Track {}: ignoring likely swap (iou {:.3}, dist {:.3})", track_id, iou, center_dist);
            return TrackUpdate {
                state: track.state,
                continuity: score,
                swap_suppressed: true,
                restarted: false,
            };
        }

        if score < self.lost_continuity {
            debug!("Track {}: lost (continuity {:.3}), restarting", track_id, score);
            *track = Track { bbox, state: fresh };
            return TrackUpdate {
                state: fresh,
                continuity: score,
                swap_suppressed: false,
                restarted: true,
            };
        }

        let alpha = smoothing_alpha(quality, score);
        let previous = track.state.smoothed_confidence;
        track.bbox = bbox;
        track.state = TrackingState {
            iou,
            center_dist,
            quality,
            smoothed_confidence: previous + alpha * (confidence - previous),
        };

        TrackUpdate {
            state: track.state,
            continuity: score,
            swap_suppressed: false,
            restarted: false,
        }
    }

    pub fn state(&self, track_id: &str) -> Option<TrackingState> {
        self.tracks.get(track_id).map(|t| t.state)
    }

    /// Drop a track explicitly (e.g. item consumed)
    pub fn remove(&mut self, track_id: &str) -> Option<TrackingState> {
        self.tracks.remove(track_id).map(|t| t.state)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_and_distance() {
        let a = BoundingBox::new(0.0, 0.0, 0.5, 0.5);
        assert!((a.iou(&a) - 1.0).abs() < 0.001);

        let b = BoundingBox::new(0.25, 0.0, 0.5, 0.5);
        // overlap 0.25 x 0.5 = 0.125, union 0.375
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 0.001);
        assert!((a.center_distance(&b) - 0.25).abs() < 0.001);

        let far = BoundingBox::new(0.6, 0.6, 0.2, 0.2);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_continuity() {
        assert!((continuity(1.0, 0.0) - 1.0).abs() < 0.001);
        assert!((continuity(0.0, 0.18) - 0.15).abs() < 0.001);
        assert_eq!(continuity(0.0, 0.5), 0.0);
    }

    #[test]
    fn test_suppress_swap() {
        assert!(suppress_swap(0.0, 0.5, 0.6));
        assert!(!suppress_swap(0.0, 0.5, 0.9));
        assert!(!suppress_swap(0.1, 0.5, 0.6));
        assert!(!suppress_swap(0.0, 0.4, 0.6));
    }

    #[test]
    fn test_smoothing_alpha_grows_with_quality() {
        assert!((smoothing_alpha(0.0, 0.0) - 0.12).abs() < 0.001);
        assert!(smoothing_alpha(1.0, 1.0) > smoothing_alpha(0.5, 0.5));
    }

    #[test]
    fn test_tracker_smooths_confidence() {
        let mut tracker = Tracker::default();
        let first = tracker.update("can", BoundingBox::new(0.2, 0.2, 0.4, 0.4), 0.8, 0.5);
        assert_eq!(first.state.smoothed_confidence, 0.5);

        let second = tracker.update("can", BoundingBox::new(0.22, 0.2, 0.4, 0.4), 0.8, 0.9);
        assert!(!second.restarted);
        assert!(second.continuity > 0.8);
        let smoothed = second.state.smoothed_confidence;
        assert!(smoothed > 0.5 && smoothed < 0.9);
    }

    #[test]
    fn test_tracker_ignores_poor_far_detection() {
        let mut tracker = Tracker::default();
        tracker.update("can", BoundingBox::new(0.0, 0.0, 0.2, 0.2), 0.9, 0.7);

        let update = tracker.update("can", BoundingBox::new(0.7, 0.7, 0.2, 0.2), 0.5, 0.2);
        assert!(update.swap_suppressed);
        assert_eq!(tracker.state("can").unwrap().smoothed_confidence, 0.7);
    }

    #[test]
    fn test_tracker_restarts_when_lost() {
        let mut tracker = Tracker::default();
        tracker.update("can", BoundingBox::new(0.0, 0.0, 0.2, 0.2), 0.9, 0.7);

        let update = tracker.update("can", BoundingBox::new(0.7, 0.7, 0.2, 0.2), 0.9, 0.3);
        assert!(update.restarted);
        assert_eq!(tracker.state("can").unwrap().smoothed_confidence, 0.3);

        assert!(tracker.remove("can").is_some());
        assert!(tracker.is_empty());
    }
}
