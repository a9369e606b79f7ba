//! Capture and detection-sampling workers.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ml_core::{Detection, DetectionSampler, InferenceEngine};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame, FrameSource, RoiMask};

use crate::monitor::{
    data::LayerTracker,
    frames::{Enqueue, FrameRouter},
    telemetry::spawn_thread,
};

/// Pause when the sensor had no frame ready.
const CAPTURE_IDLE: Duration = Duration::from_millis(2);
/// Backoff after a transient capture error.
const CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// How long the sampler waits for a frame before re-checking the stop flag.
const ANALYSIS_WAIT: Duration = Duration::from_secs(1);

/// Poll `source` until shutdown, publishing every frame. A closed sensor
/// raises the stop flag so the whole monitor winds down.
pub(crate) fn spawn_capture_worker<S>(
    mut source: S,
    roi: Option<RoiMask>,
    router: FrameRouter,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>>
where
    S: FrameSource + 'static,
{
    spawn_thread("printwatch-capture", move || {
        run_capture(&mut source, roi.as_ref(), &router, &shutdown);
        debug!("Capture worker exiting");
    })
}

pub(crate) fn run_capture<S: FrameSource + ?Sized>(
    source: &mut S,
    roi: Option<&RoiMask>,
    router: &FrameRouter,
    shutdown: &AtomicBool,
) {
    let mut warned_closed_analysis = false;
    while !shutdown.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                metrics::counter!("printwatch_frames_captured_total").increment(1);
                let analysis = match roi {
                    Some(mask) => mask.apply(&frame),
                    None => frame.clone(),
                };
                let published = router.publish(analysis, frame);
                if published.analysis == Enqueue::Closed && !warned_closed_analysis {
                    warn!("Detection sampler has stopped; frames go to the display only");
                    warned_closed_analysis = true;
                }
            }
            Ok(None) => thread::sleep(CAPTURE_IDLE),
            Err(CaptureError::Closed) => {
                info!("Capture source closed; requesting shutdown");
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => {
                warn!("Capture error: {err}");
                thread::sleep(CAPTURE_ERROR_BACKOFF);
            }
        }
    }
}

pub(crate) fn spawn_sampler_worker<E>(
    mut sampler: DetectionSampler<E>,
    frames: Receiver<Frame>,
    results: Sender<Detection>,
    layer: LayerTracker,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>>
where
    E: InferenceEngine + 'static,
{
    spawn_thread("printwatch-sampler", move || {
        run_sampler(&mut sampler, &frames, &results, &layer, &shutdown);
        debug!(
            "Sampler worker exiting after {} frames",
            sampler.frames_seen()
        );
    })
}

pub(crate) fn run_sampler<E: InferenceEngine>(
    sampler: &mut DetectionSampler<E>,
    frames: &Receiver<Frame>,
    results: &Sender<Detection>,
    layer: &LayerTracker,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match frames.recv_timeout(ANALYSIS_WAIT) {
            Ok(frame) => {
                let Some(detection) = sampler.sample(&frame, layer.get()) else {
                    continue;
                };
                debug!(
                    "Frame {} produced {} ({:.2})",
                    detection.frame_sequence, detection.defect_type, detection.confidence
                );
                if results.send(detection).is_err() {
                    error!("Supervisor is gone; stopping sampler");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crossbeam_channel::unbounded;
    use ml_core::{AdaptiveThreshold, DefectClasses, InferenceError, RawDetection};

    use super::*;
    use crate::monitor::frames::frame_pipeline;

    struct ScriptedSource {
        script: VecDeque<Result<Option<Frame>, CaptureError>>,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.script.pop_front().unwrap_or(Err(CaptureError::Closed))
        }
    }

    struct FixedEngine;

    impl InferenceEngine for FixedEngine {
        fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, InferenceError> {
            Ok(vec![RawDetection {
                class_id: 0,
                confidence: 0.72,
                bbox: [0.0, 0.0, 1.0, 1.0],
            }])
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![7; 4 * 4 * 3], 4, 4, 0, sequence)
    }

    #[test]
    fn capture_masks_analysis_copy_and_stops_on_close() {
        let (router, taps) = frame_pipeline(4);
        let shutdown = AtomicBool::new(false);
        let mut source = ScriptedSource {
            script: VecDeque::from([
                Ok(Some(frame(1))),
                Ok(None),
                Err(CaptureError::Other(anyhow::anyhow!("glitch"))),
                Ok(Some(frame(2))),
            ]),
        };
        let roi = RoiMask {
            left: 1,
            top: 1,
            right: 2,
            bottom: 2,
            reference_width: 4,
            reference_height: 4,
        };

        run_capture(&mut source, Some(&roi), &router, &shutdown);

        assert!(shutdown.load(Ordering::SeqCst));
        let analysed: Vec<Frame> = taps.analysis.try_iter().collect();
        assert_eq!(analysed.len(), 2);
        assert_eq!(analysed[0].data[0], 0);
        let displayed = taps.display.take().unwrap();
        assert_eq!(displayed.sequence, 2);
        assert_eq!(displayed.data[0], 7);
    }

    #[test]
    fn sampler_reads_the_current_layer() {
        let (tx, rx) = unbounded();
        let (results_tx, results_rx) = unbounded();
        let layer = LayerTracker::new(5);
        let shutdown = AtomicBool::new(false);
        let mut sampler = DetectionSampler::new(
            FixedEngine,
            DefectClasses::default(),
            AdaptiveThreshold::default(),
            1,
        );

        tx.send(frame(1)).unwrap();
        drop(tx);
        run_sampler(&mut sampler, &rx, &results_tx, &layer, &shutdown);
        assert_eq!(results_rx.try_iter().count(), 1);

        let (tx, rx) = unbounded();
        layer.set(60);
        tx.send(frame(2)).unwrap();
        drop(tx);
        run_sampler(&mut sampler, &rx, &results_tx, &layer, &shutdown);
        assert_eq!(results_rx.try_iter().count(), 0);
    }
}
