//! Enrolled gallery and nearest-neighbor matching.
//!
//! The gallery is swapped wholesale on reload: matchers work on an `Arc`
//! snapshot taken under a brief read lock, so a reload never exposes a
//! partially written set and never waits on an in-flight match.

use crate::store::{GalleryStore, StoreError};
use crate::types::{Embedding, GalleryEntry, IdentityId, MatchResult};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Default draw threshold: farthest distance still annotated as a match.
pub const DEFAULT_DRAW_THRESHOLD: f32 = 0.5;
/// Default commit threshold: farthest distance that writes attendance.
pub const DEFAULT_COMMIT_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("all {dropped} gallery entries were invalid; previous gallery kept")]
    NoValidEntries { dropped: usize },
    #[error("gallery store: {0}")]
    Store(#[from] StoreError),
    #[error("invalid thresholds: commit {commit} must be positive, finite and <= draw {draw}")]
    InvalidThresholds { draw: f32, commit: f32 },
}

/// A validated gallery entry.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub id: IdentityId,
    pub name: String,
    pub embedding: Embedding,
}

/// Index and distance of the closest gallery entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest {
    pub index: usize,
    pub distance: f32,
}

/// Strategy for finding the closest enrolled face to a probe.
pub trait Matcher {
    fn nearest(&self, probe: &Embedding, gallery: &[EnrolledFace]) -> Option<Nearest>;
}

/// Exhaustive Euclidean nearest-neighbor search.
///
/// Ties keep the earlier entry, so the first-loaded identity wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn nearest(&self, probe: &Embedding, gallery: &[EnrolledFace]) -> Option<Nearest> {
        let mut best: Option<Nearest> = None;
        for (index, face) in gallery.iter().enumerate() {
            let distance = probe.euclidean_distance(&face.embedding);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Nearest { index, distance });
            }
        }
        best
    }
}

/// Dual distance thresholds: `commit <= draw`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdPolicy {
    draw: f32,
    commit: f32,
}

impl ThresholdPolicy {
    pub fn new(draw: f32, commit: f32) -> Result<Self, GalleryError> {
        let valid = draw.is_finite() && commit.is_finite() && commit > 0.0 && commit <= draw;
        if !valid {
            return Err(GalleryError::InvalidThresholds { draw, commit });
        }
        Ok(Self { draw, commit })
    }

    pub fn draw(&self) -> f32 {
        self.draw
    }

    pub fn commit(&self) -> f32 {
        self.commit
    }

    pub fn is_committable(&self, distance: f32) -> bool {
        distance <= self.commit
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            draw: DEFAULT_DRAW_THRESHOLD,
            commit: DEFAULT_COMMIT_THRESHOLD,
        }
    }
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub dropped: usize,
}

pub struct Gallery<M = EuclideanMatcher> {
    faces: RwLock<Arc<Vec<EnrolledFace>>>,
    matcher: M,
}

impl Gallery {
    pub fn new() -> Self {
        Self::with_matcher(EuclideanMatcher)
    }
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Matcher> Gallery<M> {
    pub fn with_matcher(matcher: M) -> Self {
        Self {
            faces: RwLock::new(Arc::new(Vec::new())),
            matcher,
        }
    }

    /// Validate `entries` and swap them in as the active gallery.
    ///
    /// Invalid entries are dropped with a warning. If entries were supplied
    /// but none survived, the previous gallery stays active and
    /// [`GalleryError::NoValidEntries`] is returned. An empty input clears
    /// the gallery.
    pub fn load(&self, entries: Vec<GalleryEntry>) -> Result<LoadReport, GalleryError> {
        let total = entries.len();
        let mut faces = Vec::with_capacity(total);

        for entry in entries {
            match Embedding::new(entry.embedding) {
                Ok(embedding) => faces.push(EnrolledFace {
                    id: entry.id,
                    name: entry.name,
                    embedding,
                }),
                Err(e) => {
                    tracing::warn!(id = entry.id, name = %entry.name, error = %e, "dropping gallery entry");
                }
            }
        }

        let report = LoadReport {
            loaded: faces.len(),
            dropped: total - faces.len(),
        };
        if total > 0 && faces.is_empty() {
            return Err(GalleryError::NoValidEntries { dropped: total });
        }

        *self.faces.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(faces);
        tracing::info!(loaded = report.loaded, dropped = report.dropped, "gallery loaded");
        Ok(report)
    }

    /// Fetch enrolled entries from `store` and [`load`](Self::load) them.
    /// A store failure leaves the current gallery untouched.
    pub fn reload_from(&self, store: &dyn GalleryStore) -> Result<LoadReport, GalleryError> {
        let entries = store.list_enrolled()?;
        self.load(entries)
    }

    /// Current gallery contents.
    pub fn snapshot(&self) -> Arc<Vec<EnrolledFace>> {
        Arc::clone(&self.faces.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display name of the first entry with this id.
    pub fn name_of(&self, identity: IdentityId) -> Option<String> {
        self.snapshot()
            .iter()
            .find(|f| f.id == identity)
            .map(|f| f.name.clone())
    }

    /// Match a probe embedding.
    ///
    /// Returns the nearest identity when its distance is within the draw
    /// threshold. Whether the match is strong enough to commit is the
    /// caller's decision via [`ThresholdPolicy::is_committable`]. Malformed
    /// probes and an empty gallery yield [`MatchResult::Unmatched`].
    pub fn match_probe(&self, probe: &[f32], policy: &ThresholdPolicy) -> MatchResult {
        let probe = match Embedding::new(probe.to_vec()) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "probe rejected");
                return MatchResult::Unmatched;
            }
        };

        let faces = self.snapshot();
        match self.matcher.nearest(&probe, &faces) {
            Some(Nearest { index, distance }) if distance <= policy.draw() => {
                let face = &faces[index];
                MatchResult::Matched {
                    identity: face.id,
                    name: face.name.clone(),
                    distance,
                }
            }
            _ => MatchResult::Unmatched,
        }
    }
}
