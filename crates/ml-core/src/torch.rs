//! TorchScript-backed engine for YOLOv8-style exports.

use std::path::Path;

use anyhow::{Result, anyhow, bail};
use tch::{self, Device, Kind, Tensor};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{
    detection::RawDetection,
    sampler::{InferenceEngine, InferenceError},
};

/// Boxes kept per frame before the sampler's own filtering.
const MAX_DETECTIONS: usize = 512;

pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device` (CUDA when available).
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: (i64, i64), use_cpu: bool) -> Result<Self> {
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        };
        let module = tch::CModule::load_on_device(model_path.as_ref(), device)?;
        debug!(
            "Loaded {} on {device:?} (input {}x{})",
            model_path.as_ref().display(),
            input_size.0,
            input_size.1
        );
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
        })
    }

    /// Override the pre-filter applied before boxes reach the sampler.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    fn bgr_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        if !matches!(frame.format, FrameFormat::Bgr8) || frame.data.len() != frame.expected_len() {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                frame.data.len(),
                frame.expected_len()
            );
        }
        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(&frame.data[..])
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, frame.height as i64, frame.width as i64, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;
        if (frame.width as i64, frame.height as i64) == (in_w, in_h) {
            Ok(tensor)
        } else {
            Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
        }
    }

    /// Decode `[1, 4 + classes, boxes]` output into frame-space boxes.
    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<RawDetection>> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            detections.push(RawDetection {
                class_id: class_id as i64,
                confidence: score,
                bbox: [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
            });
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }
        Ok(detections)
    }
}

impl InferenceEngine for TorchDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, InferenceError> {
        let input = self
            .bgr_to_tensor(frame)
            .map_err(|err| InferenceError::InvalidFrame {
                width: frame.width,
                height: frame.height,
                reason: err.to_string(),
            })?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| anyhow!("forward pass failed: {err}"))?;
        Ok(self.decode(&output, frame)?)
    }
}
