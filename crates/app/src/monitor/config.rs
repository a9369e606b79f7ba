use std::{
    collections::HashMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use ml_core::{AdaptiveThreshold, DefectClasses};
use printer_link::{LinkPolicy, SerialConfig};
use serde::Deserialize;
use video_ingest::RoiMask;

use crate::monitor::rules::{RuleEntry, RuleTable, default_rule_entries};

/// Flags for `printwatch monitor` and `printwatch check-config`.
#[derive(Args, Clone, Debug, Default)]
pub struct MonitorCliArgs {
    /// TOML file with printer, analysis, correction and rule settings.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Serial port of the printer.
    #[arg(long)]
    pub port: Option<String>,
    #[arg(long)]
    pub baud: Option<u32>,
    /// Camera index, V4L device, RTSP URI or video file.
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub width: Option<i32>,
    #[arg(long)]
    pub height: Option<i32>,
    /// Use the OpenCV capture backend instead of ffmpeg.
    #[arg(long)]
    pub opencv: bool,
    /// Print-area rectangle `left,top,right,bottom` on the capture size.
    #[arg(long, value_delimiter = ',', value_name = "L,T,R,B")]
    pub roi: Option<Vec<i32>>,
    /// Disable the region-of-interest mask.
    #[arg(long, conflicts_with = "roi")]
    pub no_roi: bool,
    /// TorchScript defect model.
    #[arg(long, value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Model class names in class-id order.
    #[arg(long, value_delimiter = ',')]
    pub classes: Option<Vec<String>>,
    #[arg(long)]
    pub detector_width: Option<i64>,
    #[arg(long)]
    pub detector_height: Option<i64>,
    /// Minimum detector score before a box is kept.
    #[arg(long, value_name = "SCORE")]
    pub detector_confidence: Option<f32>,
    #[arg(long)]
    pub cpu: bool,
    /// Analyze one frame in every N.
    #[arg(long)]
    pub decimation: Option<u32>,
    /// Seconds between corrections.
    #[arg(long, value_name = "SECS")]
    pub cooldown: Option<u64>,
    /// Overall wait for a printer response; 0 waits forever.
    #[arg(long, value_name = "MS")]
    pub response_timeout_ms: Option<u64>,
    #[arg(long)]
    pub initial_layer: Option<u32>,
    /// Derive the layer from the Z position using this layer height (mm).
    #[arg(long, value_name = "MM")]
    pub layer_height: Option<f32>,
    #[arg(long, value_name = "ADDR")]
    pub preview_addr: Option<SocketAddr>,
    #[arg(long)]
    pub jpeg_quality: Option<u8>,
    /// Append defect and correction events to this JSON-lines file.
    #[arg(long, value_name = "PATH")]
    pub event_log: Option<PathBuf>,
    #[arg(long)]
    pub chrome_trace: Option<PathBuf>,
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryOptions {
    pub verbose: bool,
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct PrinterSettings {
    pub serial: SerialConfig,
    pub policy: LinkPolicy,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureSettings {
    pub source_uri: String,
    pub width: i32,
    pub height: i32,
    pub use_opencv: bool,
    pub roi: Option<RoiMask>,
    /// How long startup waits for the reader's first frame.
    pub first_frame_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisSettings {
    pub model_path: Option<PathBuf>,
    pub classes: DefectClasses,
    pub detector_size: (i64, i64),
    pub detector_confidence: f32,
    pub use_cpu: bool,
    pub decimation: u32,
    pub thresholds: AdaptiveThreshold,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CorrectionSettings {
    pub cooldown: Duration,
    pub rules: RuleTable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorSettings {
    pub initial_layer: u32,
    pub layer_height: Option<f32>,
    pub status_interval: Duration,
    pub idle_sleep: Duration,
    pub join_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PreviewSettings {
    pub addr: SocketAddr,
    pub jpeg_quality: u8,
    pub size: (u32, u32),
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub printer: PrinterSettings,
    pub capture: CaptureSettings,
    pub analysis: AnalysisSettings,
    pub correction: CorrectionSettings,
    pub supervisor: SupervisorSettings,
    pub preview: PreviewSettings,
    pub event_log: Option<PathBuf>,
    pub telemetry: TelemetryOptions,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            printer: PrinterSettings {
                serial: SerialConfig::default(),
                policy: LinkPolicy::default(),
            },
            capture: CaptureSettings {
                source_uri: "0".to_string(),
                width: 1920,
                height: 1080,
                use_opencv: false,
                roi: Some(RoiMask::default()),
                first_frame_timeout: Duration::from_secs(10),
            },
            analysis: AnalysisSettings {
                model_path: None,
                classes: DefectClasses::default(),
                detector_size: (640, 640),
                detector_confidence: 0.25,
                use_cpu: false,
                decimation: 6,
                thresholds: AdaptiveThreshold::default(),
                queue_capacity: 10,
            },
            correction: CorrectionSettings {
                cooldown: Duration::from_secs(30),
                rules: RuleTable::default(),
            },
            supervisor: SupervisorSettings {
                initial_layer: 0,
                layer_height: None,
                status_interval: Duration::from_secs(1),
                idle_sleep: Duration::from_millis(5),
                join_timeout: Duration::from_secs(2),
            },
            preview: PreviewSettings {
                addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
                jpeg_quality: 70,
                size: (960, 540),
            },
            event_log: None,
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// On-disk layout. Every key is optional; absent keys keep the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FileConfig {
    printer: PrinterSection,
    capture: CaptureSection,
    analysis: AnalysisSection,
    correction: CorrectionSection,
    supervisor: SupervisorSection,
    preview: PreviewSection,
    /// Replaces the built-in table as a whole when present.
    rules: Option<HashMap<String, Vec<RuleEntry>>>,
    event_log: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PrinterSection {
    port: Option<String>,
    baud: Option<u32>,
    settle_ms: Option<u64>,
    retry_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CaptureSection {
    source: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    opencv: Option<bool>,
    roi: Option<[i32; 4]>,
    first_frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AnalysisSection {
    model: Option<PathBuf>,
    classes: Option<DefectClasses>,
    detector_size: Option<[i64; 2]>,
    detector_confidence: Option<f32>,
    cpu: Option<bool>,
    decimation: Option<u32>,
    thresholds: Option<AdaptiveThreshold>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CorrectionSection {
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SupervisorSection {
    initial_layer: Option<u32>,
    layer_height: Option<f32>,
    status_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PreviewSection {
    addr: Option<SocketAddr>,
    jpeg_quality: Option<u8>,
    width: Option<u32>,
    height: Option<u32>,
}

impl FileConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn response_limit(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| millis(ms))
}

fn roi_from(rect: [i32; 4], width: i32, height: i32, origin: &str) -> Result<RoiMask> {
    let [left, top, right, bottom] = rect;
    if left < 0 || top < 0 || left >= right || top >= bottom {
        bail!("{origin} must be left,top,right,bottom with left < right and top < bottom");
    }
    Ok(RoiMask {
        left,
        top,
        right,
        bottom,
        reference_width: width,
        reference_height: height,
    })
}

impl MonitorConfig {
    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        let FileConfig {
            printer,
            capture,
            analysis,
            correction,
            supervisor,
            preview,
            rules,
            event_log,
        } = file;

        if let Some(port) = printer.port {
            self.printer.serial.port = port;
        }
        if let Some(baud) = printer.baud {
            self.printer.serial.baud = baud;
        }
        if let Some(ms) = printer.read_timeout_ms {
            self.printer.serial.read_timeout = millis(ms);
        }
        if let Some(ms) = printer.settle_ms {
            self.printer.policy.settle = millis(ms);
        }
        if let Some(ms) = printer.retry_ms {
            self.printer.policy.retry = millis(ms);
        }
        if let Some(ms) = printer.response_timeout_ms {
            self.printer.policy.response_timeout = response_limit(ms);
        }

        if let Some(source) = capture.source {
            self.capture.source_uri = source;
        }
        if let Some(width) = capture.width {
            self.capture.width = width;
        }
        if let Some(height) = capture.height {
            self.capture.height = height;
        }
        if let Some(opencv) = capture.opencv {
            self.capture.use_opencv = opencv;
        }
        if let Some(rect) = capture.roi {
            self.capture.roi = Some(roi_from(
                rect,
                self.capture.width,
                self.capture.height,
                "capture.roi",
            )?);
        }
        if let Some(ms) = capture.first_frame_timeout_ms {
            self.capture.first_frame_timeout = millis(ms);
        }

        if let Some(model) = analysis.model {
            self.analysis.model_path = Some(model);
        }
        if let Some(classes) = analysis.classes {
            self.analysis.classes = classes;
        }
        if let Some([w, h]) = analysis.detector_size {
            self.analysis.detector_size = (w, h);
        }
        if let Some(confidence) = analysis.detector_confidence {
            self.analysis.detector_confidence = confidence;
        }
        if let Some(cpu) = analysis.cpu {
            self.analysis.use_cpu = cpu;
        }
        if let Some(decimation) = analysis.decimation {
            self.analysis.decimation = decimation;
        }
        if let Some(thresholds) = analysis.thresholds {
            self.analysis.thresholds = thresholds;
        }
        if let Some(capacity) = analysis.queue_capacity {
            self.analysis.queue_capacity = capacity;
        }

        if let Some(secs) = correction.cooldown_secs {
            self.correction.cooldown = Duration::from_secs(secs);
        }
        if let Some(entries) = rules {
            self.correction.rules = RuleTable::from_entries(entries).context("Invalid [rules]")?;
        }

        if let Some(layer) = supervisor.initial_layer {
            self.supervisor.initial_layer = layer;
        }
        if let Some(height) = supervisor.layer_height {
            self.supervisor.layer_height = Some(height);
        }
        if let Some(ms) = supervisor.status_interval_ms {
            self.supervisor.status_interval = millis(ms);
        }

        if let Some(addr) = preview.addr {
            self.preview.addr = addr;
        }
        if let Some(quality) = preview.jpeg_quality {
            self.preview.jpeg_quality = quality;
        }
        if let Some(width) = preview.width {
            self.preview.size.0 = width;
        }
        if let Some(height) = preview.height {
            self.preview.size.1 = height;
        }

        if event_log.is_some() {
            self.event_log = event_log;
        }
        Ok(())
    }

    fn apply_cli(&mut self, args: MonitorCliArgs) -> Result<()> {
        if let Some(port) = args.port {
            self.printer.serial.port = port;
        }
        if let Some(baud) = args.baud {
            self.printer.serial.baud = baud;
        }
        if let Some(ms) = args.response_timeout_ms {
            self.printer.policy.response_timeout = response_limit(ms);
        }

        if let Some(source) = args.source {
            self.capture.source_uri = source;
        }
        if let Some(width) = args.width {
            self.capture.width = width;
        }
        if let Some(height) = args.height {
            self.capture.height = height;
        }
        if args.opencv {
            self.capture.use_opencv = true;
        }
        if args.no_roi {
            self.capture.roi = None;
        } else if let Some(rect) = args.roi {
            let rect: [i32; 4] = rect
                .try_into()
                .map_err(|_| anyhow!("--roi takes exactly four values"))?;
            self.capture.roi = Some(roi_from(
                rect,
                self.capture.width,
                self.capture.height,
                "--roi",
            )?);
        }

        if let Some(model) = args.model {
            self.analysis.model_path = Some(model);
        }
        if let Some(classes) = args.classes {
            self.analysis.classes = DefectClasses::new(classes);
        }
        if let Some(width) = args.detector_width {
            self.analysis.detector_size.0 = width;
        }
        if let Some(height) = args.detector_height {
            self.analysis.detector_size.1 = height;
        }
        if let Some(confidence) = args.detector_confidence {
            self.analysis.detector_confidence = confidence;
        }
        if args.cpu {
            self.analysis.use_cpu = true;
        }
        if let Some(decimation) = args.decimation {
            self.analysis.decimation = decimation;
        }

        if let Some(secs) = args.cooldown {
            self.correction.cooldown = Duration::from_secs(secs);
        }

        if let Some(layer) = args.initial_layer {
            self.supervisor.initial_layer = layer;
        }
        if let Some(height) = args.layer_height {
            self.supervisor.layer_height = Some(height);
        }

        if let Some(addr) = args.preview_addr {
            self.preview.addr = addr;
        }
        if let Some(quality) = args.jpeg_quality {
            self.preview.jpeg_quality = quality;
        }
        if args.event_log.is_some() {
            self.event_log = args.event_log;
        }

        self.telemetry = TelemetryOptions {
            verbose: args.verbose,
            chrome_trace_path: args.chrome_trace,
        };
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.printer.serial.port.trim().is_empty() {
            bail!("--port must name a serial device");
        }
        if self.printer.serial.baud == 0 {
            bail!("--baud must be positive");
        }
        if self.capture.width <= 0 || self.capture.height <= 0 {
            bail!("--width and --height must be positive integers");
        }
        if self.capture.first_frame_timeout.is_zero() {
            bail!("capture.first_frame_timeout_ms must be positive");
        }
        if self.analysis.detector_size.0 <= 0 || self.analysis.detector_size.1 <= 0 {
            bail!("--detector-width and --detector-height must be positive integers");
        }
        if !(0.0..=1.0).contains(&self.analysis.detector_confidence) {
            bail!(
                "--detector-confidence must lie in [0, 1], got {}",
                self.analysis.detector_confidence
            );
        }
        if self.analysis.decimation == 0 {
            bail!("--decimation must be at least 1");
        }
        if self.analysis.queue_capacity == 0 {
            bail!("analysis.queue_capacity must be at least 1");
        }
        if self.analysis.classes.is_empty() {
            bail!("--classes must name at least one defect type");
        }
        let thresholds = &self.analysis.thresholds;
        for floor in [
            thresholds.early_floor,
            thresholds.mid_floor,
            thresholds.late_floor,
        ] {
            if !(0.0..=1.0).contains(&floor) {
                bail!("analysis.thresholds floors must lie in [0, 1], got {floor}");
            }
        }
        if thresholds.early_layers > thresholds.mid_layers {
            bail!("analysis.thresholds.early_layers must not exceed mid_layers");
        }
        if let Some(height) = self.supervisor.layer_height {
            if !(height.is_finite() && height > 0.0) {
                bail!("--layer-height must be a positive number of millimetres");
            }
        }
        if !(1..=100).contains(&self.preview.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if self.preview.size.0 == 0 || self.preview.size.1 == 0 {
            bail!("preview width and height must be positive");
        }
        Ok(())
    }
}

impl TryFrom<MonitorCliArgs> for MonitorConfig {
    type Error = anyhow::Error;

    /// Defaults, then the `--config` file, then CLI flags.
    fn try_from(args: MonitorCliArgs) -> Result<Self> {
        let mut config = MonitorConfig::default();
        config.correction.rules = RuleTable::from_entries(default_rule_entries())?;
        if let Some(path) = args.config.as_deref() {
            config.apply_file(FileConfig::load(path)?)?;
        }
        config.apply_cli(args)?;
        config.validate()?;
        Ok(config)
    }
}
