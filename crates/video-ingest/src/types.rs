use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Immutable BGR8 frame. Cloning shares the pixel buffer, so every consumer
/// queue can hold its own handle without copying or mutating another's.
#[derive(Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    /// Arrival order assigned by the reader.
    pub sequence: u64,
    pub format: FrameFormat,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: i32, height: i32, timestamp_ms: i64, sequence: u64) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            timestamp_ms,
            sequence,
            format: FrameFormat::Bgr8,
        }
    }

    /// Expected buffer length for the frame's dimensions.
    pub fn expected_len(&self) -> usize {
        self.width.max(0) as usize * self.height.max(0) as usize * self.format.channels()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source closed")]
    Closed,
    #[error("no frame from video source within {waited:?}")]
    NoFrame { waited: Duration },
    #[error(transparent)]
    Other(#[from] Error),
}
