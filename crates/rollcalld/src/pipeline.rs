//! Per-session frame pipeline: capture, throttled detection and matching,
//! attendance marking, annotation and JPEG encoding.
//!
//! Each call to [`FramePipeline::next_frame`] blocks on exactly one device
//! read, so the consumer pulling frames sets the pace.

use crate::config::{Config, ConfigError};
use crate::overlay::{self, Annotation, FrameThrottle, StatusPanel};
use image::RgbImage;
use rollcall_core::{Deduplicator, FaceModel, Gallery, MatchResult, Session, ThresholdPolicy};
use rollcall_hw::frame::{self, FrameError};
use rollcall_hw::{CameraError, FrameSource};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera read failed: {0}")]
    Device(#[from] CameraError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

impl PipelineError {
    /// Whether the frame loop has to stop. Only device reads are fatal;
    /// a bad or unencodable frame is skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub thresholds: ThresholdPolicy,
    pub process_every: u32,
    pub downsample: u32,
    pub jpeg_quality: u8,
    pub retain_overlay: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            thresholds: config.thresholds()?,
            process_every: config.process_every,
            downsample: config.downsample,
            jpeg_quality: config.jpeg_quality,
            retain_overlay: config.retain_overlay,
        })
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            thresholds: ThresholdPolicy::default(),
            process_every: 3,
            downsample: 4,
            jpeg_quality: 85,
            retain_overlay: true,
        }
    }
}

/// Shared pieces every session's pipeline works against.
#[derive(Clone)]
pub struct Recognition {
    pub model: Arc<Mutex<Box<dyn FaceModel>>>,
    pub gallery: Arc<Gallery>,
    pub dedup: Arc<Deduplicator>,
}

/// One emitted frame.
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub jpeg: Vec<u8>,
    /// Face annotations drawn on this frame.
    pub annotations: Vec<Annotation>,
    /// Whether detection ran on this frame.
    pub processed: bool,
}

pub struct FramePipeline {
    source: Box<dyn FrameSource>,
    recognition: Recognition,
    session: Arc<Session>,
    settings: PipelineSettings,
    throttle: FrameThrottle,
    overlay: Vec<Annotation>,
}

impl FramePipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        recognition: Recognition,
        session: Arc<Session>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            recognition,
            session,
            throttle: FrameThrottle::new(settings.process_every),
            settings,
            overlay: Vec::new(),
        }
    }

    pub fn next_frame(&mut self) -> Result<RenderedFrame, PipelineError> {
        // A buffer that dequeued but will not decode costs one frame, not the session.
        let captured = self.source.read_frame().map_err(|e| match e {
            CameraError::Frame(bad) => PipelineError::Frame(bad),
            other => PipelineError::Device(other),
        })?;
        let sequence = captured.sequence;
        let mut image = captured.into_image()?;

        let processed = self.throttle.tick();
        let annotations = if processed {
            let fresh = self.detect(&image).unwrap_or_default();
            self.overlay = fresh.clone();
            fresh
        } else if self.settings.retain_overlay {
            self.overlay.clone()
        } else {
            Vec::new()
        };

        overlay::draw_annotations(&mut image, &annotations);
        overlay::draw_status_panel(
            &mut image,
            &StatusPanel {
                enrolled: self.recognition.gallery.len(),
                present: self.session.recognized_count(),
                frame: self.throttle.frames(),
            },
        );

        let jpeg = overlay::encode_jpeg(&image, self.settings.jpeg_quality)?;
        tracing::debug!(sequence, processed, faces = annotations.len(), bytes = jpeg.len(), "frame emitted");

        Ok(RenderedFrame {
            jpeg,
            annotations,
            processed,
        })
    }

    /// Detect, match and mark. `None` when the detector fails on this frame.
    fn detect(&self, image: &RgbImage) -> Option<Vec<Annotation>> {
        let factor = self.settings.downsample.max(1);
        let small = frame::downsample(image, factor);

        let faces = {
            let mut model = self
                .recognition
                .model
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match model.detect_and_encode(&small) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed; frame left unannotated");
                    return None;
                }
            }
        };

        let policy = &self.settings.thresholds;
        let annotations = faces
            .into_iter()
            .map(|face| {
                let bbox = face.bbox.scaled(factor as f32);
                let result = self.recognition.gallery.match_probe(&face.embedding, policy);
                if let MatchResult::Matched { identity, distance, .. } = &result {
                    if policy.is_committable(*distance) {
                        let confidence = result.confidence().unwrap_or(0.0);
                        if let Err(e) =
                            self.recognition
                                .dedup
                                .mark_if_new(&self.session, *identity, confidence)
                        {
                            tracing::warn!(identity, error = %e, "attendance not recorded");
                        }
                    }
                }
                Annotation::from_match(bbox, &result, policy)
            })
            .collect();

        Some(annotations)
    }
}
