//! Print monitoring: capture, defect sampling, correction and preview.
//!
//! The module is split into focused submodules:
//! - `config`: CLI flags, TOML file layout and validation.
//! - `rules`: correction rule tables and command templates.
//! - `correction`: the decision engine and its global cooldown.
//! - `frames`: analysis queue and latest-frame display slot.
//! - `workers`: capture and sampler threads.
//! - `supervisor`: the loop that owns the printer link.
//! - `display` / `server`: JPEG preview and its HTTP endpoints.
//! - `events`: defect and correction notifications.
//! - `telemetry`: tracing subscriber and Prometheus recorder.
//! - `pipeline`: startup, wiring and shutdown.

pub use config::{MonitorCliArgs, MonitorConfig};
pub use pipeline::{check_config, run};

mod config;
mod correction;
mod data;
mod display;
mod events;
mod frames;
mod pipeline;
mod rules;
mod server;
mod supervisor;
mod telemetry;
mod workers;
