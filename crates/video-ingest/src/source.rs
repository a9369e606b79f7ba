use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::types::{CaptureError, Frame};

/// Non-blocking frame poll implemented by every sensor.
pub trait FrameSource: Send {
    /// Return the next frame if one is ready.
    ///
    /// `Ok(None)` means nothing new yet; `Err(CaptureError::Closed)` means the
    /// sensor is gone for good.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Adapts a background reader channel into a polled source. Dropping it
/// releases the reader thread and its device.
#[derive(Debug)]
pub struct ChannelSource {
    rx: Receiver<Result<Frame, CaptureError>>,
    pending: Option<Frame>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Result<Frame, CaptureError>>) -> Self {
        Self { rx, pending: None }
    }

    /// Block up to `timeout` for the reader's first frame, so a missing or
    /// unreadable device fails here instead of on the first poll. The frame
    /// is kept and returned by the next `next_frame`.
    pub fn await_first_frame(
        rx: Receiver<Result<Frame, CaptureError>>,
        timeout: Duration,
    ) -> Result<Self, CaptureError> {
        match rx.recv_timeout(timeout) {
            Ok(Ok(frame)) => Ok(Self {
                rx,
                pending: Some(frame),
            }),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::NoFrame { waited: timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        match self.rx.try_recv() {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(err)) => Err(err),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CaptureError::Closed),
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}
