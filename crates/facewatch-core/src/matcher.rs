//! Nearest-neighbour identity matching over the enrolled gallery.

use crate::types::{BoundingBox, Embedding, FaceDetection, IdentityRecord};

/// Read-only snapshot of enrolled identities, shared with the pipeline thread.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<IdentityRecord>,
}

impl Gallery {
    pub fn new(entries: Vec<IdentityRecord>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IdentityRecord] {
        &self.entries
    }

    pub fn contains_name(&self, display_name: &str) -> bool {
        self.entries.iter().any(|e| e.display_name == display_name)
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest entry, `None` for an empty gallery.
    pub distance: Option<f32>,
    /// `max(0, 1 - distance)`, reported even for rejected matches.
    pub confidence: f32,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
}

impl MatchResult {
    fn unknown(distance: Option<f32>, confidence: f32) -> Self {
        Self {
            matched: false,
            distance,
            confidence,
            identity_id: None,
            display_name: None,
        }
    }

    /// Attach this result to a located face.
    pub fn into_detection(self, bbox: BoundingBox) -> FaceDetection {
        FaceDetection {
            bbox,
            identity_id: self.identity_id,
            display_name: self.display_name,
            confidence: self.confidence,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher with two acceptance bounds.
///
/// A match is accepted only when the best distance passes both the tolerance
/// and the distance threshold, i.e. `distance <= min(tolerance, distance_threshold)`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub tolerance: f32,
    pub distance_threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32, distance_threshold: f32) -> Self {
        Self { tolerance, distance_threshold }
    }

    pub fn acceptance_bound(&self) -> f32 {
        self.tolerance.min(self.distance_threshold)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries.iter().enumerate() {
            let dist = probe.euclidean_distance(&entry.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return MatchResult::unknown(None, 0.0);
        };

        let confidence = (1.0 - best_dist).max(0.0);
        if best_dist <= self.acceptance_bound() {
            let entry = &gallery.entries[idx];
            MatchResult {
                matched: true,
                distance: Some(best_dist),
                confidence,
                identity_id: Some(entry.identity_id.clone()),
                display_name: Some(entry.display_name.clone()),
            }
        } else {
            MatchResult::unknown(Some(best_dist), confidence)
        }
    }
}
