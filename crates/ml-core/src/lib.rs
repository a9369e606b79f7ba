//! Defect detection for the print monitor.
//!
//! Inference itself is a black box behind [`InferenceEngine`]; this crate
//! decides which frames reach it and which of its outputs count as a defect.

pub use detection::{DefectClasses, Detection, RawDetection};
pub use sampler::{DetectionSampler, InferenceEngine, InferenceError};
pub use threshold::AdaptiveThreshold;

#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

mod detection;
mod sampler;
mod threshold;
#[cfg(feature = "with-tch")]
mod torch;
