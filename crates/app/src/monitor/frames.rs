//! Single-producer fan-out of captured frames.
//!
//! The analysis path is a bounded queue that drops new frames when full; the
//! display path is a one-frame slot where a newer frame evicts an unread one.
//! Neither path ever blocks the producer.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use video_ingest::Frame;

/// Capacity-1 slot holding the most recent unconsumed value.
#[derive(Debug, Default)]
pub struct LatestSlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store `value`, returning the unconsumed value it evicted.
    pub fn replace(&self, value: T) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
    }

    pub fn take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// Queue full; the new frame was discarded.
    Dropped,
    /// The analysis consumer has gone away.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Published {
    pub analysis: Enqueue,
    pub display_evicted: bool,
}

/// Producer half.
#[derive(Clone)]
pub struct FrameRouter {
    analysis: Sender<Frame>,
    display: Arc<LatestSlot<Frame>>,
}

/// Consumer halves.
pub struct FrameTaps {
    pub analysis: Receiver<Frame>,
    pub display: Arc<LatestSlot<Frame>>,
}

pub fn frame_pipeline(analysis_capacity: usize) -> (FrameRouter, FrameTaps) {
    let (tx, rx) = bounded(analysis_capacity.max(1));
    let display = Arc::new(LatestSlot::new());
    (
        FrameRouter {
            analysis: tx,
            display: display.clone(),
        },
        FrameTaps {
            analysis: rx,
            display,
        },
    )
}

impl FrameRouter {
    /// Offer `analysis` to the detection path and `display` to the preview
    /// path. The two may be distinct images of the same capture (the analysis
    /// copy is usually masked).
    pub fn publish(&self, analysis: Frame, display: Frame) -> Published {
        let analysis = match self.analysis.try_send(analysis) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(_)) => {
                metrics::counter!("printwatch_frames_dropped_total", "queue" => "analysis")
                    .increment(1);
                Enqueue::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Enqueue::Closed,
        };
        let display_evicted = self.display.replace(display).is_some();
        if display_evicted {
            metrics::counter!("printwatch_frames_dropped_total", "queue" => "display")
                .increment(1);
        }
        Published {
            analysis,
            display_evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![0; 12], 2, 2, 0, sequence)
    }

    #[test]
    fn display_slot_keeps_only_the_newest_frame() {
        let (router, taps) = frame_pipeline(10);

        let first = router.publish(frame(1), frame(1));
        let second = router.publish(frame(2), frame(2));

        assert!(!first.display_evicted);
        assert!(second.display_evicted);
        assert_eq!(taps.display.take().map(|f| f.sequence), Some(2));
        assert!(taps.display.take().is_none());
    }

    #[test]
    fn full_analysis_queue_drops_without_blocking() {
        let (router, taps) = frame_pipeline(2);
        router.publish(frame(1), frame(1));
        router.publish(frame(2), frame(2));

        let started = Instant::now();
        let outcome = router.publish(frame(3), frame(3));

        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(outcome.analysis, Enqueue::Dropped);
        let queued: Vec<u64> = taps.analysis.try_iter().map(|f| f.sequence).collect();
        assert_eq!(queued, vec![1, 2]);
        assert_eq!(taps.display.take().map(|f| f.sequence), Some(3));
    }

    #[test]
    fn closed_analysis_path_still_feeds_display() {
        let (router, taps) = frame_pipeline(2);
        let FrameTaps { analysis, display } = taps;
        drop(analysis);

        let outcome = router.publish(frame(1), frame(1));

        assert_eq!(outcome.analysis, Enqueue::Closed);
        assert!(display.take().is_some());
    }
}
