//! Frame decimation and defect selection around an inference engine.

use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::{
    detection::{DefectClasses, Detection, RawDetection},
    threshold::AdaptiveThreshold,
};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("frame {width}x{height} rejected by detector: {reason}")]
    InvalidFrame {
        width: i32,
        height: i32,
        reason: String,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Maps an image to zero or more classified, scored, localized boxes.
/// Synchronous and possibly slow.
pub trait InferenceEngine: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, InferenceError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, InferenceError> {
        (**self).infer(frame)
    }
}

/// Forwards every Nth frame to the engine and reduces its output to at most
/// one qualifying defect.
pub struct DetectionSampler<E> {
    engine: E,
    classes: DefectClasses,
    thresholds: AdaptiveThreshold,
    decimation: u64,
    frames_seen: u64,
}

impl<E: InferenceEngine> DetectionSampler<E> {
    /// `decimation` is clamped to at least 1 (analyze every frame).
    pub fn new(
        engine: E,
        classes: DefectClasses,
        thresholds: AdaptiveThreshold,
        decimation: u32,
    ) -> Self {
        Self {
            engine,
            classes,
            thresholds,
            decimation: u64::from(decimation.max(1)),
            frames_seen: 0,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Count `frame` and, on every Nth call, run inference and return the
    /// highest-confidence detection of a known defect type whose confidence
    /// exceeds the floor for `current_layer`.
    ///
    /// Inference failures are logged and treated as "no detection".
    pub fn sample(&mut self, frame: &Frame, current_layer: u32) -> Option<Detection> {
        self.frames_seen = self.frames_seen.wrapping_add(1);
        if self.frames_seen % self.decimation != 0 {
            return None;
        }

        metrics::counter!("printwatch_frames_sampled_total").increment(1);
        let started = Instant::now();
        let raw = match self.engine.infer(frame) {
            Ok(raw) => raw,
            Err(err) => {
                metrics::counter!("printwatch_inference_failures_total").increment(1);
                warn!("Inference failed on frame #{}: {err}", frame.sequence);
                return None;
            }
        };
        metrics::histogram!("printwatch_inference_seconds")
            .record(started.elapsed().as_secs_f64());

        let floor = self.thresholds.floor(current_layer);
        let best = self.select(&raw, floor)?;
        let defect_type = self.classes.name(best.class_id)?.to_string();
        debug!(
            "frame #{}: {defect_type} conf={:.3} (floor {floor:.2}, {} raw box(es))",
            frame.sequence,
            best.confidence,
            raw.len()
        );

        Some(Detection {
            defect_type,
            confidence: best.confidence,
            bbox: best.bbox,
            frame_sequence: frame.sequence,
            timestamp_ms: frame.timestamp_ms,
        })
    }

    /// Max-search over qualifying boxes; the first of equal confidences wins.
    fn select<'a>(&self, raw: &'a [RawDetection], floor: f32) -> Option<&'a RawDetection> {
        raw.iter()
            .filter(|det| det.confidence > floor && self.classes.name(det.class_id).is_some())
            .fold(None, |best: Option<&RawDetection>, det| match best {
                Some(current) if det.confidence <= current.confidence => Some(current),
                _ => Some(det),
            })
    }
}
