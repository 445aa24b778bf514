//! rollcall-core — Recognition and attendance engine.
//!
//! Matches face embeddings against an enrolled gallery with a dual
//! threshold policy and records at most one attendance mark per identity
//! per day. Face detection (SCRFD) and 128-d encoding run via ONNX Runtime.

pub mod dedup;
pub mod detector;
pub mod encoder;
pub mod gallery;
pub mod model;
pub mod session;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use dedup::Deduplicator;
pub use gallery::{EuclideanMatcher, Gallery, GalleryError, LoadReport, Matcher, ThresholdPolicy};
pub use model::{DetectedFace, FaceModel, ModelError, OnnxFaceModel};
pub use session::{Session, SessionSnapshot, SessionSummary};
pub use store::{
    AttendanceMark, AttendanceRecord, AttendanceStatus, AttendanceStore, GalleryStore, SessionLog,
    StoreError,
};
pub use types::{BoundingBox, Embedding, GalleryEntry, IdentityId, MatchResult, EMBEDDING_DIM};

/// System-wide location of the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}
