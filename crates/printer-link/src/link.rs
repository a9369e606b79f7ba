//! Connection state machine for the printer channel.
//!
//! `Disconnected → Connecting → Connected`, with `Connected → Connecting` on any
//! transport fault. The link is owned by exactly one thread (the supervisory
//! loop), so nothing here is synchronised; only the optional stop flag is shared.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    error::LinkError,
    protocol::{Marker, Position, Response, TemperatureSnapshot, gcode},
    transport::{Connector, Transport},
};

/// Granularity of interruptible sleeps while a stop flag is attached.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Timing policy for connecting and waiting on responses.
#[derive(Clone, Debug)]
pub struct LinkPolicy {
    /// Wait after opening the channel so the firmware can finish booting.
    pub settle: Duration,
    /// Wait between failed open attempts.
    pub retry: Duration,
    /// Upper bound on the wait for a terminal marker. `None` waits forever.
    pub response_timeout: Option<Duration>,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            retry: Duration::from_secs(5),
            response_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Operations the supervisory loop and correction engine need from a printer.
pub trait Printer {
    fn send(&mut self, command: &str) -> Result<Response, LinkError>;

    fn query_temperature(&mut self) -> Option<TemperatureSnapshot>;

    fn query_position(&mut self) -> Option<Position> {
        None
    }
}

pub struct PrinterLink<C: Connector> {
    connector: C,
    transport: Option<C::Transport>,
    state: LinkState,
    policy: LinkPolicy,
    stop: Option<Arc<AtomicBool>>,
    reconnects: u64,
    ever_connected: bool,
    greeting: Option<String>,
}

impl<C: Connector> PrinterLink<C> {
    pub fn new(connector: C, policy: LinkPolicy) -> Self {
        Self {
            connector,
            transport: None,
            state: LinkState::Disconnected,
            policy,
            stop: None,
            reconnects: 0,
            ever_connected: false,
            greeting: None,
        }
    }

    /// Abort the otherwise endless `Connecting` loop once `stop` is raised.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Number of successful connects after the first one.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Line read right after the last successful connect, if any.
    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    /// Single open attempt. Used at startup, where an absent printer is fatal.
    pub fn connect_once(&mut self) -> Result<(), LinkError> {
        self.state = LinkState::Connecting;
        match self.connector.open() {
            Ok(transport) => {
                self.establish(transport);
                Ok(())
            }
            Err(source) => {
                self.state = LinkState::Disconnected;
                Err(LinkError::Open {
                    target: self.connector.describe(),
                    source,
                })
            }
        }
    }

    /// Retry opening the channel until it succeeds or the stop flag is raised.
    pub fn connect(&mut self) -> Result<(), LinkError> {
        self.state = LinkState::Connecting;
        let target = self.connector.describe();
        info!("Connecting to printer on {target}");
        loop {
            if self.stop_requested() {
                return Err(LinkError::Cancelled);
            }
            match self.connector.open() {
                Ok(transport) => {
                    self.establish(transport);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "Printer connection on {target} failed: {err}; retrying in {:?}",
                        self.policy.retry
                    );
                    self.wait(self.policy.retry);
                }
            }
        }
    }

    fn establish(&mut self, mut transport: C::Transport) {
        self.wait(self.policy.settle);
        self.greeting = match transport.read_line() {
            Ok(line) => line,
            Err(err) => {
                debug!("No greeting from printer: {err}");
                None
            }
        };
        if self.ever_connected {
            self.reconnects = self.reconnects.saturating_add(1);
            metrics::counter!("printwatch_link_reconnects_total").increment(1);
        }
        info!(
            "Printer connected on {} (greeting: {})",
            self.connector.describe(),
            self.greeting.as_deref().unwrap_or("<none>")
        );
        self.ever_connected = true;
        self.transport = Some(transport);
        self.state = LinkState::Connected;
    }

    /// Send one command and collect its response.
    ///
    /// Blocks through `Connecting` first when the link is down. A transport
    /// fault abandons this command and leaves the link in `Connecting`; the
    /// command is never resent.
    pub fn send(&mut self, command: &str) -> Result<Response, LinkError> {
        if self.state != LinkState::Connected || self.transport.is_none() {
            self.connect()?;
        }
        let Some(mut transport) = self.transport.take() else {
            return Err(LinkError::Cancelled);
        };

        let started = Instant::now();
        let outcome = exchange(&mut transport, command, started, self.policy.response_timeout);
        metrics::histogram!("printwatch_command_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(response) => {
                self.transport = Some(transport);
                Ok(response)
            }
            Err(err @ LinkError::Rejected { .. }) => {
                self.transport = Some(transport);
                warn!("{err}");
                Err(err)
            }
            Err(err) => {
                error!("{err}; reconnecting before the next command");
                drop(transport);
                self.state = LinkState::Connecting;
                Err(err)
            }
        }
    }

    /// Fetch a fresh temperature snapshot; `None` on any failure.
    pub fn query_temperature(&mut self) -> Option<TemperatureSnapshot> {
        let response = self.send(gcode::GET_TEMPERATURE).ok()?;
        let snapshot = TemperatureSnapshot::parse(response.as_str());
        if snapshot.is_none() {
            warn!("Unparseable temperature report: {:?}", response.as_str());
        }
        snapshot
    }

    pub fn query_position(&mut self) -> Option<Position> {
        let response = self.send(gcode::GET_POSITION).ok()?;
        Position::parse(response.as_str())
    }

    pub fn emergency_stop(&mut self) -> Result<Response, LinkError> {
        error!("EMERGENCY STOP ({}) triggered", gcode::EMERGENCY_STOP);
        self.send(gcode::EMERGENCY_STOP)
    }

    pub fn set_hotend_temp(&mut self, target: f32) -> Result<Response, LinkError> {
        self.send(&crate::Heater::Hotend.set_command(target))
    }

    pub fn set_bed_temp(&mut self, target: f32) -> Result<Response, LinkError> {
        self.send(&crate::Heater::Bed.set_command(target))
    }

    pub fn set_speed(&mut self, percentage: u32) -> Result<Response, LinkError> {
        self.send(&gcode::set_speed(percentage))
    }

    pub fn set_flow(&mut self, percentage: u32) -> Result<Response, LinkError> {
        self.send(&gcode::set_flow(percentage))
    }

    pub fn set_fan(&mut self, duty: u8) -> Result<Response, LinkError> {
        self.send(&gcode::set_fan(duty))
    }

    pub fn home(&mut self) -> Result<Response, LinkError> {
        self.send(gcode::HOME_ALL)
    }

    pub fn move_to(&mut self, x: f32, y: f32, z: f32, feed: f32) -> Result<Response, LinkError> {
        self.send(&gcode::move_to(x, y, z, feed))
    }

    pub fn show_message(&mut self, message: &str) -> Result<Response, LinkError> {
        self.send(&gcode::show_message(message))
    }

    /// Show `reason` on the LCD, then pause.
    pub fn pause(&mut self, reason: &str) -> Result<Response, LinkError> {
        if let Err(err) = self.show_message(reason) {
            debug!("Pause message not shown: {err}");
        }
        self.send(gcode::PAUSE_PRINT)
    }

    pub fn resume(&mut self) -> Result<Response, LinkError> {
        if let Err(err) = self.show_message("AI RESUMED") {
            debug!("Resume message not shown: {err}");
        }
        self.send(gcode::RESUME_PRINT)
    }

    /// Release the channel.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            info!("Printer connection closed");
        }
        self.state = LinkState::Disconnected;
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::Relaxed))
    }

    fn wait(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        if self.stop.is_none() {
            thread::sleep(duration);
            return;
        }
        let deadline = Instant::now() + duration;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl<C: Connector> Printer for PrinterLink<C> {
    fn send(&mut self, command: &str) -> Result<Response, LinkError> {
        PrinterLink::send(self, command)
    }

    fn query_temperature(&mut self) -> Option<TemperatureSnapshot> {
        PrinterLink::query_temperature(self)
    }

    fn query_position(&mut self) -> Option<Position> {
        PrinterLink::query_position(self)
    }
}

/// Write `command` and read until a terminal marker. Blank lines and empty
/// polls are skipped.
fn exchange<T: Transport>(
    transport: &mut T,
    command: &str,
    started: Instant,
    limit: Option<Duration>,
) -> Result<Response, LinkError> {
    let transport_fault = |source| LinkError::Transport {
        command: command.to_string(),
        source,
    };

    debug!("-> {command}");
    transport.write_line(command).map_err(transport_fault)?;

    let mut response = Response::default();
    loop {
        if let Some(limit) = limit {
            let waited = started.elapsed();
            if waited > limit {
                return Err(LinkError::Timeout {
                    command: command.to_string(),
                    waited,
                });
            }
        }

        let line = match transport.read_line().map_err(transport_fault)? {
            Some(line) => line,
            None => continue,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("<- {line}");
        response.push_line(line);

        match Marker::classify(line) {
            Some(Marker::Success) => return Ok(response),
            Some(Marker::Failure) => {
                return Err(LinkError::Rejected {
                    command: command.to_string(),
                    response: response.as_str().trim_end().to_string(),
                });
            }
            None => {}
        }
    }
}
