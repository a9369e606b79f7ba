//! Serial G-code link to a 3D printer.
//!
//! The crate is split into focused modules:
//! - `transport`: the byte-level seam plus the `serialport` implementation.
//! - `protocol`: command formatting, terminal markers, and response parsing.
//! - `link`: the connection state machine with transparent reconnect.
//! - `error`: typed failures surfaced to callers.

pub use error::LinkError;
pub use link::{LinkPolicy, LinkState, Printer, PrinterLink};
pub use protocol::{Heater, Marker, Position, Response, TemperatureSnapshot, gcode};
pub use transport::{Connector, SerialConfig, SerialConnector, SerialTransport, Transport};

mod error;
mod link;
mod protocol;
mod transport;
