//! The supervisory loop: the single owner of the printer link and the
//! correction engine.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, TryRecvError};
use ml_core::Detection;
use printer_link::Printer;
use tracing::{debug, error, warn};
use video_ingest::Frame;

use crate::monitor::{
    correction::{CorrectionEngine, CorrectionOutcome},
    data::{DefectSummary, FrameMetadata, LayerTracker, Temperatures},
    display::Display,
    events::EventSink,
    frames::LatestSlot,
};

/// Poll granularity while waiting for workers to stop.
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Inputs the loop drains each iteration.
pub struct SupervisorInputs {
    pub detections: Receiver<Detection>,
    pub display_frames: Arc<LatestSlot<Frame>>,
}

pub struct Supervisor<P, D> {
    printer: P,
    engine: CorrectionEngine,
    events: Box<dyn EventSink>,
    display: D,
    inputs: SupervisorInputs,
    layer: LayerTracker,
    layer_height: Option<f32>,
    status_interval: Duration,
    last_status: Option<Instant>,
    temperatures: Option<Temperatures>,
    last_defect: Option<DefectSummary>,
    sampler_gone: bool,
}

impl<P: Printer, D: Display> Supervisor<P, D> {
    pub fn new(
        printer: P,
        engine: CorrectionEngine,
        events: Box<dyn EventSink>,
        display: D,
        inputs: SupervisorInputs,
        layer: LayerTracker,
    ) -> Self {
        Self {
            printer,
            engine,
            events,
            display,
            inputs,
            layer,
            layer_height: None,
            status_interval: Duration::from_secs(1),
            last_status: None,
            temperatures: None,
            last_defect: None,
            sampler_gone: false,
        }
    }

    /// Derive the layer from the reported Z position.
    pub fn with_layer_height(mut self, layer_height: Option<f32>) -> Self {
        self.layer_height = layer_height;
        self
    }

    /// Minimum spacing between status queries made for display metadata.
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    #[cfg(test)]
    pub fn printer_mut(&mut self) -> &mut P {
        &mut self.printer
    }

    /// Hand back the printer, display and event sink for shutdown.
    pub fn into_parts(self) -> (P, D, Box<dyn EventSink>) {
        (self.printer, self.display, self.events)
    }

    /// Iterate until `shutdown` is raised, sleeping `idle` whenever both
    /// inputs were empty.
    pub fn run(&mut self, shutdown: &AtomicBool, idle: Duration) {
        while !shutdown.load(Ordering::SeqCst) {
            if !self.step() {
                thread::sleep(idle);
            }
        }
    }

    /// One iteration: at most one detection, then the latest display frame.
    /// Returns whether either input had work.
    pub fn step(&mut self) -> bool {
        let mut busy = false;

        match self.inputs.detections.try_recv() {
            Ok(detection) => {
                busy = true;
                self.handle_detection(&detection);
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                if !self.sampler_gone {
                    warn!("Detection sampler has stopped; corrections are no longer possible");
                    self.sampler_gone = true;
                }
            }
        }

        if let Some(frame) = self.inputs.display_frames.take() {
            busy = true;
            self.refresh_status(Instant::now());
            let metadata = FrameMetadata {
                layer: self.layer.get(),
                temperatures: self.temperatures,
                last_defect: self.last_defect.clone(),
                timestamp_ms: frame.timestamp_ms,
                frame_sequence: frame.sequence,
            };
            self.display.broadcast(frame, metadata);
        }

        busy
    }

    fn handle_detection(&mut self, detection: &Detection) {
        metrics::counter!(
            "printwatch_detections_total",
            "defect" => detection.defect_type.clone()
        )
        .increment(1);
        self.events
            .defect_detected(detection, self.layer.get());
        self.last_defect = Some(DefectSummary::from(detection));

        let outcome = self
            .engine
            .apply(detection, &mut self.printer, self.events.as_ref());
        if let CorrectionOutcome::SendFailed { command, reason } = &outcome {
            self.events
                .system(&format!("correction {command} failed: {reason}"));
        }
    }

    fn refresh_status(&mut self, now: Instant) {
        let due = self
            .last_status
            .is_none_or(|last| now.saturating_duration_since(last) >= self.status_interval);
        if !due {
            return;
        }
        self.last_status = Some(now);
        self.temperatures = self.printer.query_temperature().map(Temperatures::from);

        if let Some(height) = self.layer_height {
            if let Some(position) = self.printer.query_position() {
                let layer = layer_from_z(position.z, height);
                if layer != self.layer.get() {
                    debug!("Layer {layer} (Z {:.2})", position.z);
                    self.layer.set(layer);
                }
            }
        }
    }
}

fn layer_from_z(z: f32, layer_height: f32) -> u32 {
    let layer = (z / layer_height).round();
    if layer.is_finite() && layer > 0.0 {
        layer as u32
    } else {
        0
    }
}

/// Wait up to `timeout` in total for every worker, then move on regardless.
pub(crate) fn join_with_timeout(workers: Vec<(&'static str, JoinHandle<()>)>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for (name, handle) in workers {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("{name} worker panicked");
            }
        } else {
            warn!("{name} worker did not stop within {timeout:?}; continuing shutdown");
        }
    }
}
