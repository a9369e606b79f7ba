//! Wires the devices, workers and supervisory loop together.

use std::{
    path::Path,
    time::Duration,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use ml_core::{DetectionSampler, InferenceEngine};
use printer_link::{PrinterLink, SerialConnector};
use tracing::{info, warn};
use video_ingest::ChannelSource;

use crate::monitor::{
    config::{AnalysisSettings, CaptureSettings, MonitorConfig},
    correction::CorrectionEngine,
    data::{LayerTracker, SharedPacket},
    display::spawn_preview_encoder,
    events::{EventFanout, EventSink, JsonlEventSink, TracingEventSink},
    frames::frame_pipeline,
    server::spawn_preview_server,
    supervisor::{Supervisor, SupervisorInputs, join_with_timeout},
    telemetry,
    workers::{spawn_capture_worker, spawn_sampler_worker},
};

/// Run until Ctrl+C or until the capture source closes.
///
/// The model, camera and printer must all be available at startup; failing to
/// acquire any of them aborts before a worker starts.
pub fn run(config: MonitorConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let monitor_span = tracing::info_span!(
        "printwatch.monitor",
        port = %config.printer.serial.port,
        source = %config.capture.source_uri,
        decimation = config.analysis.decimation,
        cooldown_secs = config.correction.cooldown.as_secs()
    );
    let _monitor_span_guard = monitor_span.enter();

    let engine = load_engine(&config.analysis)?;
    let source = open_source(&config.capture)?;
    let mut link = PrinterLink::new(
        SerialConnector::new(config.printer.serial.clone()),
        config.printer.policy.clone(),
    )
    .with_stop_flag(shutdown.clone());
    link.connect_once().with_context(|| {
        format!(
            "Failed to connect to printer on {}",
            config.printer.serial.port
        )
    })?;

    let events = build_events(config.event_log.as_deref())?;
    events.system("monitoring started");

    let shared: SharedPacket = Arc::new(Mutex::new(None));
    let server = spawn_preview_server(config.preview.addr, shared.clone())?;
    info!("Preview server listening on http://{}", server.local_addr());
    let (display, encoder) = spawn_preview_encoder(config.preview.clone(), shared)
        .context("Failed to spawn preview encoder")?;

    let (router, taps) = frame_pipeline(config.analysis.queue_capacity);
    let (results_tx, results_rx) = unbounded();
    let layer = LayerTracker::new(config.supervisor.initial_layer);
    let sampler = DetectionSampler::new(
        engine,
        config.analysis.classes.clone(),
        config.analysis.thresholds,
        config.analysis.decimation,
    );

    let capture_handle =
        spawn_capture_worker(source, config.capture.roi, router, shutdown.clone())
            .context("Failed to spawn capture worker")?;
    let sampler_handle = spawn_sampler_worker(
        sampler,
        taps.analysis,
        results_tx,
        layer.clone(),
        shutdown.clone(),
    )
    .context("Failed to spawn sampler worker")?;

    let mut supervisor = Supervisor::new(
        link,
        CorrectionEngine::new(
            config.correction.rules.clone(),
            config.correction.cooldown,
        ),
        Box::new(events),
        display,
        SupervisorInputs {
            detections: results_rx,
            display_frames: taps.display,
        },
        layer,
    )
    .with_layer_height(config.supervisor.layer_height)
    .with_status_interval(config.supervisor.status_interval);

    info!(
        "Monitoring {} with printer on {}",
        config.capture.source_uri, config.printer.serial.port
    );
    supervisor.run(&shutdown, config.supervisor.idle_sleep);

    info!("Shutting down");
    shutdown.store(true, Ordering::SeqCst);
    join_with_timeout(
        vec![("capture", capture_handle), ("sampler", sampler_handle)],
        config.supervisor.join_timeout,
    );

    let (mut link, display, events) = supervisor.into_parts();
    info!("Printer link reconnected {} time(s)", link.reconnects());
    link.close();
    drop(display);
    join_with_timeout(
        vec![("preview encoder", encoder)],
        config.supervisor.join_timeout,
    );
    server.stop();
    events.system("monitoring stopped");
    Ok(())
}

/// Validate the configuration and print the effective settings without
/// opening any device.
pub fn check_config(config: &MonitorConfig) -> Result<()> {
    let serial = &config.printer.serial;
    println!("printer   {} @ {} baud", serial.port, serial.baud);
    match config.printer.policy.response_timeout {
        Some(limit) => println!("          response timeout {limit:?}"),
        None => println!("          response timeout unbounded"),
    }

    let capture = &config.capture;
    let backend = if capture.use_opencv { "opencv" } else { "ffmpeg" };
    println!(
        "capture   {} ({}x{}, {backend})",
        capture.source_uri, capture.width, capture.height
    );
    match capture.roi {
        Some(roi) => println!(
            "          roi {},{} - {},{}",
            roi.left, roi.top, roi.right, roi.bottom
        ),
        None => println!("          roi disabled"),
    }

    let analysis = &config.analysis;
    let thresholds = &analysis.thresholds;
    println!(
        "analysis  every {} frame(s), classes [{}]",
        analysis.decimation,
        analysis.classes.names().join(", ")
    );
    println!(
        "          detector {}x{}, min score {:.2}",
        analysis.detector_size.0, analysis.detector_size.1, analysis.detector_confidence
    );
    println!(
        "          floors {:.2} (< layer {}), {:.2} (< layer {}), {:.2}",
        thresholds.early_floor,
        thresholds.early_layers,
        thresholds.mid_floor,
        thresholds.mid_layers,
        thresholds.late_floor
    );
    match &analysis.model_path {
        Some(path) => println!("          model {}", path.display()),
        None => println!("          model not set"),
    }

    println!(
        "cooldown  {}s (global)",
        config.correction.cooldown.as_secs()
    );
    println!("preview   http://{}", config.preview.addr);
    println!("rules");
    let rules = &config.correction.rules;
    if rules.is_empty() {
        println!("  (none; detections are logged only)");
    }
    for defect in rules.defect_types() {
        println!("  {defect}");
        for (idx, rule) in rules.get(defect).unwrap_or_default().iter().enumerate() {
            println!(
                "    {}. {:<12} > {:.2}  {}",
                idx + 1,
                rule.command,
                rule.threshold,
                rule.description
            );
        }
    }
    for class in analysis.classes.names() {
        if rules.get(class).is_none() {
            println!("  ({class}: detected but no rule)");
        }
    }
    Ok(())
}

fn build_events(event_log: Option<&Path>) -> Result<EventFanout> {
    let fanout = EventFanout::new().with(TracingEventSink);
    match event_log {
        Some(path) => Ok(fanout.with(JsonlEventSink::create(path)?)),
        None => Ok(fanout),
    }
}

fn open_source(capture: &CaptureSettings) -> Result<ChannelSource> {
    let size = (capture.width, capture.height);
    let rx = if capture.use_opencv {
        open_opencv(&capture.source_uri, size)?
    } else {
        video_ingest::spawn_ffmpeg_reader(&capture.source_uri, size)
            .with_context(|| format!("Failed to start capture from {}", capture.source_uri))?
    };
    first_frame(rx, &capture.source_uri, capture.first_frame_timeout)
}

/// A reader that exits or stays silent before its first frame means the
/// camera is not usable; fail startup rather than monitoring nothing.
fn first_frame(
    rx: crossbeam_channel::Receiver<Result<video_ingest::Frame, video_ingest::CaptureError>>,
    uri: &str,
    timeout: Duration,
) -> Result<ChannelSource> {
    let source = ChannelSource::await_first_frame(rx, timeout)
        .with_context(|| format!("Failed to acquire video source {uri}"))?;
    info!("Video source {uri} delivered its first frame");
    Ok(source)
}

#[cfg(feature = "with-opencv")]
fn open_opencv(
    uri: &str,
    size: (i32, i32),
) -> Result<crossbeam_channel::Receiver<Result<video_ingest::Frame, video_ingest::CaptureError>>> {
    video_ingest::spawn_camera_reader(uri, size)
        .with_context(|| format!("Failed to open camera {uri}"))
}

#[cfg(not(feature = "with-opencv"))]
fn open_opencv(
    _uri: &str,
    _size: (i32, i32),
) -> Result<crossbeam_channel::Receiver<Result<video_ingest::Frame, video_ingest::CaptureError>>> {
    anyhow::bail!("--opencv requires a build with the `with-opencv` feature")
}

#[cfg(feature = "with-tch")]
fn load_engine(analysis: &AnalysisSettings) -> Result<Box<dyn InferenceEngine>> {
    let path = analysis
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Missing model path. Provide --model <path>."))?;
    let detector = ml_core::TorchDetector::new(path, analysis.detector_size, analysis.use_cpu)
        .with_context(|| format!("Failed to load model {}", path.display()))?
        .with_confidence_threshold(analysis.detector_confidence);
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn load_engine(_analysis: &AnalysisSettings) -> Result<Box<dyn InferenceEngine>> {
    anyhow::bail!(
        "printwatch was built without an inference backend; rebuild with `--features with-tch`"
    )
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;
    use video_ingest::{CaptureError, Frame, FrameSource};

    use super::*;

    #[test]
    fn reader_exiting_before_any_frame_fails_startup() {
        let (tx, rx) = bounded::<Result<Frame, CaptureError>>(1);
        drop(tx);

        let err = first_frame(rx, "/dev/video0", Duration::from_secs(5)).unwrap_err();

        assert!(format!("{err:#}").contains("Failed to acquire video source /dev/video0"));
        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::Closed)
        ));
    }

    #[test]
    fn silent_reader_fails_startup_after_timeout() {
        let (_tx, rx) = bounded::<Result<Frame, CaptureError>>(1);

        let err = first_frame(rx, "rtsp://cam", Duration::from_millis(20)).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CaptureError>(),
            Some(CaptureError::NoFrame { .. })
        ));
    }

    #[test]
    fn first_frame_is_handed_to_the_source() {
        let (tx, rx) = bounded(1);
        tx.send(Ok(Frame::new(vec![0; 3], 1, 1, 0, 42))).unwrap();

        let mut source = first_frame(rx, "0", Duration::from_secs(1)).unwrap();

        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence, 42);
    }
}
