//! Serial transport to the arm controller board
//!
//! Synchronous, timeout-bounded request/response exchange over one serial
//! device. Replies are collected by polling the port in short slices until a
//! completion predicate holds or the timeout elapses. A timeout is not an
//! error here: whatever arrived (possibly nothing) is handed back to the
//! caller to interpret.

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::{config::SerialConfig, ArmError, Result};

/// Line terminator expected by the firmware
pub const LINE_TERMINATOR: &str = "\r\n";

/// Byte-level access to a device. Implemented for real serial ports and for
/// scripted fakes in tests.
pub trait Port: Send {
    /// Drop any unread input
    fn clear_input(&mut self) -> io::Result<()>;

    /// Write everything and block until it has been flushed to the device
    fn write_all_flushed(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Wait up to `slice` for input. Returns 0 when nothing arrived.
    fn read_slice(&mut self, buf: &mut [u8], slice: Duration) -> io::Result<usize>;
}

/// `serialport` backed device
pub struct SerialDevice {
    port: Box<dyn SerialPort>,
    current_timeout: Duration,
}

impl SerialDevice {
    /// Open `path` in raw 8N1 mode without flow control
    pub fn open(path: &str, baud_rate: u32, poll_slice: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(poll_slice)
            .open()?;
        port.clear(ClearBuffer::Input)?;
        Ok(Self { port, current_timeout: poll_slice })
    }
}

impl Port for SerialDevice {
    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn write_all_flushed(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_slice(&mut self, buf: &mut [u8], slice: Duration) -> io::Result<usize> {
        if self.current_timeout != slice {
            self.port.set_timeout(slice).map_err(io::Error::from)?;
            self.current_timeout = slice;
        }
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// How a reply to a G-code line was classified
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Response contained `ok`
    Ack(String),
    /// Response contained `error`
    Rejected(String),
    /// Nothing conclusive arrived before the timeout
    Silent(String),
}

impl Reply {
    pub fn classify(response: &[u8]) -> Self {
        let text = String::from_utf8_lossy(response).trim().to_string();
        let lower = text.to_ascii_lowercase();
        if lower.contains("error") {
            Reply::Rejected(text)
        } else if lower.contains("ok") {
            Reply::Ack(text)
        } else {
            Reply::Silent(text)
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Reply::Ack(text) | Reply::Rejected(text) | Reply::Silent(text) => text,
        }
    }
}

/// Completion predicate for G-code acknowledgements
pub fn ack_received(buffer: &[u8]) -> bool {
    let lower = String::from_utf8_lossy(buffer).to_ascii_lowercase();
    lower.contains("ok") || lower.contains("error")
}

/// Completion predicate that never fires; reads run to the timeout
pub fn never_complete(_buffer: &[u8]) -> bool {
    false
}

/// Structured telemetry record formats offered by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryFormat {
    Csv,
    Json,
    Xml,
}

impl TelemetryFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "c" | "csv" => Some(TelemetryFormat::Csv),
            "j" | "json" => Some(TelemetryFormat::Json),
            "x" | "xml" => Some(TelemetryFormat::Xml),
            _ => None,
        }
    }

    /// Single byte that asks the firmware for one record
    pub fn request_byte(self) -> u8 {
        match self {
            TelemetryFormat::Csv => b'c',
            TelemetryFormat::Json => b'j',
            TelemetryFormat::Xml => b'x',
        }
    }

    pub fn is_complete(self, buffer: &[u8]) -> bool {
        match self {
            TelemetryFormat::Csv => buffer.iter().any(|b| *b == b'\n' || *b == b'\r'),
            TelemetryFormat::Json => buffer.contains(&b'}'),
            TelemetryFormat::Xml => String::from_utf8_lossy(buffer).contains("</registro>"),
        }
    }

    /// Trim a raw record; CSV records end at the first line break
    pub fn finish(self, raw: &[u8]) -> String {
        let text = String::from_utf8_lossy(raw).to_string();
        match self {
            TelemetryFormat::Csv => match text.find(['\r', '\n']) {
                Some(end) => text[..end].to_string(),
                None => text,
            },
            _ => text.trim().to_string(),
        }
    }
}

/// Exclusive owner of one device handle
pub struct SerialTransport {
    port: Box<dyn Port>,
    poll_slice: Duration,
    device: String,
}

impl SerialTransport {
    pub fn new(port: Box<dyn Port>, poll_slice: Duration, device: &str) -> Self {
        Self {
            port,
            poll_slice,
            device: device.to_string(),
        }
    }

    /// Open a real serial device
    pub fn open(device_path: &str, baud_rate: u32, poll_slice: Duration) -> Result<Self> {
        let device = SerialDevice::open(device_path, baud_rate, poll_slice)?;
        Ok(Self::new(Box::new(device), poll_slice, device_path))
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Discard stale input, then write `text` plus the line terminator
    pub fn send(&mut self, text: &str) -> Result<()> {
        debug!("-> {}", text);
        let mut line = String::with_capacity(text.len() + LINE_TERMINATOR.len());
        line.push_str(text);
        line.push_str(LINE_TERMINATOR);
        self.send_raw(line.as_bytes())
    }

    /// Discard stale input, then write `bytes` as-is
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.clear_input()?;
        self.port.write_all_flushed(bytes)?;
        Ok(())
    }

    /// Poll until `is_complete` accepts the accumulated bytes or `timeout` passes
    pub fn receive_until<F>(&mut self, timeout: Duration, is_complete: F) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let start = Instant::now();
        let mut collected = Vec::new();
        let mut chunk = [0u8; 256];

        while !is_complete(&collected) {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            let slice = self.poll_slice.min(timeout - elapsed);
            let n = self.port.read_slice(&mut chunk, slice)?;
            collected.extend_from_slice(&chunk[..n]);
        }

        if !collected.is_empty() {
            debug!("<- {}", String::from_utf8_lossy(&collected).trim());
        }
        Ok(collected)
    }

    /// Send one G-code line and classify the reply
    pub fn exchange(&mut self, code: &str, timeout: Duration) -> Result<Reply> {
        self.send(code)?;
        let response = self.receive_until(timeout, ack_received)?;
        Ok(Reply::classify(&response))
    }
}

/// Opens a transport on demand; the controller owns one of these so that
/// `connect()` can be retried after a failure.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<SerialTransport>;
}

/// Tries each configured device path in order
#[derive(Debug, Clone)]
pub struct SerialConnector {
    paths: Vec<String>,
    baud_rate: u32,
    poll_slice: Duration,
}

impl SerialConnector {
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            paths: config.device_paths(),
            baud_rate: config.baud_rate,
            poll_slice: config.poll_slice(),
        }
    }
}

impl Connector for SerialConnector {
    fn connect(&mut self) -> Result<SerialTransport> {
        let mut last_error = None;
        for path in &self.paths {
            match SerialTransport::open(path, self.baud_rate, self.poll_slice) {
                Ok(transport) => {
                    info!("Opened serial device {} at {} baud", path, self.baud_rate);
                    return Ok(transport);
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ArmError::Config("no serial device configured".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPort;

    fn transport(port: ScriptedPort) -> SerialTransport {
        SerialTransport::new(Box::new(port), Duration::from_millis(1), "scripted")
    }

    #[test]
    fn test_send_appends_crlf_and_clears_input() {
        let port = ScriptedPort::new();
        let log = port.log();
        let mut t = transport(port);
        t.send("G28").unwrap();
        assert_eq!(log.written(), vec!["G28\r\n".to_string()]);
        assert_eq!(log.clears(), 1);
    }

    #[test]
    fn test_receive_stops_at_terminal_token() {
        let port = ScriptedPort::new();
        port.queue_chunks(&["busy\n", "ok\n", "late\n"]);
        let mut t = transport(port);
        let bytes = t.receive_until(Duration::from_secs(2), ack_received).unwrap();
        assert_eq!(String::from_utf8_lossy(&bytes), "busy\nok\n");
    }

    #[test]
    fn test_timeout_returns_partial_data() {
        let port = ScriptedPort::new();
        port.queue_chunks(&["echo:busy"]);
        let mut t = transport(port);
        let bytes = t.receive_until(Duration::from_millis(20), ack_received).unwrap();
        assert_eq!(String::from_utf8_lossy(&bytes), "echo:busy");
        assert_eq!(Reply::classify(&bytes), Reply::Silent("echo:busy".to_string()));
    }

    #[test]
    fn test_read_failure_propagates() {
        let port = ScriptedPort::new();
        port.fail_reads();
        let mut t = transport(port);
        let err = t.receive_until(Duration::from_millis(20), ack_received).unwrap_err();
        assert!(matches!(err, ArmError::Io(_)));
    }

    #[test]
    fn test_reply_classification() {
        assert!(matches!(Reply::classify(b"ok\n"), Reply::Ack(_)));
        assert!(matches!(Reply::classify(b"Error: unknown command\n"), Reply::Rejected(_)));
        assert!(matches!(Reply::classify(b""), Reply::Silent(_)));
    }

    #[test]
    fn test_telemetry_terminators() {
        assert!(TelemetryFormat::Csv.is_complete(b"1,50,2,3.5\r\n"));
        assert!(!TelemetryFormat::Json.is_complete(b"{\"caudal\": 3"));
        assert!(TelemetryFormat::Json.is_complete(b"{\"caudal\": 3}"));
        assert!(TelemetryFormat::Xml.is_complete(b"<registro><caudal>3</caudal></registro>"));
        assert_eq!(TelemetryFormat::Csv.finish(b"1,50,2,3.5\r\nnext"), "1,50,2,3.5");
        assert_eq!(TelemetryFormat::from_name("JSON"), Some(TelemetryFormat::Json));
        assert_eq!(TelemetryFormat::from_name("yaml"), None);
    }
}
