use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use ml_core::Detection;
use printer_link::TemperatureSnapshot;
use serde::Serialize;

/// Current print layer, written by the supervisory loop and read by the
/// sampler at the moment of each call.
#[derive(Clone, Debug, Default)]
pub struct LayerTracker(Arc<AtomicU32>);

impl LayerTracker {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, layer: u32) {
        self.0.store(layer, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Temperatures {
    pub hotend_actual: f32,
    pub hotend_target: f32,
    pub bed_actual: f32,
    pub bed_target: f32,
}

impl From<TemperatureSnapshot> for Temperatures {
    fn from(snapshot: TemperatureSnapshot) -> Self {
        Self {
            hotend_actual: snapshot.hotend_actual,
            hotend_target: snapshot.hotend_target,
            bed_actual: snapshot.bed_actual,
            bed_target: snapshot.bed_target,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DefectSummary {
    pub defect_type: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub timestamp_ms: i64,
}

impl From<&Detection> for DefectSummary {
    fn from(detection: &Detection) -> Self {
        Self {
            defect_type: detection.defect_type.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
            timestamp_ms: detection.timestamp_ms,
        }
    }
}

/// What accompanies every frame handed to the display.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameMetadata {
    pub layer: u32,
    pub temperatures: Option<Temperatures>,
    pub last_defect: Option<DefectSummary>,
    pub timestamp_ms: i64,
    pub frame_sequence: u64,
}

/// Encoded preview frame as served over HTTP.
#[derive(Clone)]
pub(crate) struct PreviewPacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) metadata: FrameMetadata,
}

pub(crate) type SharedPacket = Arc<Mutex<Option<PreviewPacket>>>;
