//! Byte-level channel to the printer.
//!
//! `Connector` produces a fresh `Transport` on every (re)connect so the link can
//! recreate the physical channel in place after a fault.

use std::{
    io::{self, BufRead, BufReader, Write},
    time::Duration,
};

use serialport::SerialPort;

/// Line-oriented duplex channel.
pub trait Transport: Send {
    /// Write one command line; the terminator is appended by the transport.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` when the per-read wait elapsed with no complete line.
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Factory for transports.
pub trait Connector: Send {
    type Transport: Transport;

    fn open(&mut self) -> io::Result<Self::Transport>;

    /// Human readable target used in log messages.
    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Per-read wait before `read_line` reports an empty poll.
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// Opens `serialport` channels with a fixed configuration.
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn open(&mut self) -> io::Result<SerialTransport> {
        let port = serialport::new(&self.config.port, self.config.baud)
            .timeout(self.config.read_timeout)
            .open()?;
        Ok(SerialTransport::new(port))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.config.port, self.config.baud)
    }
}

pub struct SerialTransport {
    reader: BufReader<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl SerialTransport {
    fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            reader: BufReader::new(port),
            pending: Vec::with_capacity(128),
        }
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let port = self.reader.get_mut();
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<String>> {
        // A timed-out read may leave a partial line in `pending`; it is kept
        // for the next call.
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed",
            )),
            Ok(_) if self.pending.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(err),
        }
    }
}
