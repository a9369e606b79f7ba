//! Observability sinks for defect and correction notifications.
//!
//! Nothing here affects control flow; a failing sink only logs.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ml_core::Detection;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::monitor::correction::AppliedCorrection;

pub trait EventSink: Send + Sync {
    fn defect_detected(&self, detection: &Detection, layer: u32);

    fn correction_applied(&self, correction: &AppliedCorrection);

    fn system(&self, message: &str);
}

/// Emits events on the `printwatch::events` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn defect_detected(&self, detection: &Detection, layer: u32) {
        warn!(
            target: "printwatch::events",
            defect = %detection.defect_type,
            confidence = detection.confidence,
            layer,
            frame = detection.frame_sequence,
            "defect detected"
        );
    }

    fn correction_applied(&self, correction: &AppliedCorrection) {
        error!(
            target: "printwatch::events",
            defect = %correction.defect_type,
            confidence = correction.confidence,
            command = %correction.command,
            "correction applied: {}",
            correction.description
        );
    }

    fn system(&self, message: &str) {
        info!(target: "printwatch::events", "{message}");
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventRecord<'a> {
    Defect {
        at: DateTime<Utc>,
        layer: u32,
        #[serde(flatten)]
        detection: &'a Detection,
    },
    Correction {
        at: DateTime<Utc>,
        #[serde(flatten)]
        correction: &'a AppliedCorrection,
    },
    System {
        at: DateTime<Utc>,
        message: &'a str,
    },
}

/// Appends one JSON object per line.
pub struct JsonlEventSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlEventSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, record: &EventRecord<'_>) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let result = serde_json::to_writer(&mut *writer, record)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(err) = result {
            warn!("failed to append to event log: {err}");
        }
    }
}

impl EventSink for JsonlEventSink {
    fn defect_detected(&self, detection: &Detection, layer: u32) {
        self.write(&EventRecord::Defect {
            at: Utc::now(),
            layer,
            detection,
        });
    }

    fn correction_applied(&self, correction: &AppliedCorrection) {
        self.write(&EventRecord::Correction {
            at: Utc::now(),
            correction,
        });
    }

    fn system(&self, message: &str) {
        self.write(&EventRecord::System {
            at: Utc::now(),
            message,
        });
    }
}

#[derive(Default)]
pub struct EventFanout {
    sinks: Vec<Box<dyn EventSink>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for EventFanout {
    fn defect_detected(&self, detection: &Detection, layer: u32) {
        for sink in &self.sinks {
            sink.defect_detected(detection, layer);
        }
    }

    fn correction_applied(&self, correction: &AppliedCorrection) {
        for sink in &self.sinks {
            sink.correction_applied(correction);
        }
    }

    fn system(&self, message: &str) {
        for sink in &self.sinks {
            sink.system(message);
        }
    }
}
