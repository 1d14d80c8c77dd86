//! Scripted fake device for unit tests
//!
//! Every written line is recorded; replies are produced from prefix rules
//! (first match wins) or a default reply, and handed out one chunk per read.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use crate::transport::{Connector, Port, SerialTransport};
use crate::{ArmError, Result};

#[derive(Debug, Clone)]
pub(crate) enum Response {
    Reply(String),
    Silent,
}

#[derive(Debug)]
struct DeviceState {
    written: Vec<String>,
    clears: usize,
    opens: usize,
    pending: VecDeque<Vec<u8>>,
    rules: Vec<(String, Response)>,
    default: Response,
    fail_reads: bool,
    fail_writes: bool,
    fail_open: bool,
}

/// Shared view of the fake device, usable after the port moved into a transport
#[derive(Debug, Clone)]
pub(crate) struct DeviceLog {
    state: Arc<Mutex<DeviceState>>,
}

impl DeviceLog {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                written: Vec::new(),
                clears: 0,
                opens: 0,
                pending: VecDeque::new(),
                rules: Vec::new(),
                default: Response::Reply("ok\n".to_string()),
                fail_reads: false,
                fail_writes: false,
                fail_open: false,
            })),
        }
    }

    /// Raw writes, terminators included
    pub fn written(&self) -> Vec<String> {
        self.state.lock().unwrap().written.clone()
    }

    /// Written lines without the line terminator
    pub fn lines(&self) -> Vec<String> {
        self.written().iter().map(|w| w.trim_end().to_string()).collect()
    }

    pub fn clears(&self) -> usize {
        self.state.lock().unwrap().clears
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn reset_written(&self) {
        self.state.lock().unwrap().written.clear();
    }

    pub fn respond(&self, prefix: &str, response: Response) {
        self.state.lock().unwrap().rules.push((prefix.to_string(), response));
    }

    pub fn clear_rules(&self) {
        self.state.lock().unwrap().rules.clear();
    }

    pub fn set_default(&self, response: Response) {
        self.state.lock().unwrap().default = response;
    }

    pub fn fail_writes(&self) {
        self.state.lock().unwrap().fail_writes = true;
    }

    pub fn fail_open(&self) {
        self.state.lock().unwrap().fail_open = true;
    }
}

pub(crate) struct ScriptedPort {
    log: DeviceLog,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self { log: DeviceLog::new() }
    }

    pub fn log(&self) -> DeviceLog {
        self.log.clone()
    }

    /// Pre-load unsolicited input, one chunk per read
    pub fn queue_chunks(&self, chunks: &[&str]) {
        let mut state = self.log.state.lock().unwrap();
        state.pending.extend(chunks.iter().map(|c| c.as_bytes().to_vec()));
    }

    pub fn fail_reads(&self) {
        self.log.state.lock().unwrap().fail_reads = true;
    }
}

impl Port for ScriptedPort {
    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.log.state.lock().unwrap();
        state.clears += 1;
        state.pending.clear();
        Ok(())
    }

    fn write_all_flushed(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.log.state.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let text = String::from_utf8_lossy(bytes).to_string();
        let line = text.trim_end().to_string();
        state.written.push(text);

        let response = state
            .rules
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| state.default.clone());
        if let Response::Reply(reply) = response {
            state.pending.push_back(reply.into_bytes());
        }
        Ok(())
    }

    fn read_slice(&mut self, buf: &mut [u8], _slice: Duration) -> io::Result<usize> {
        let mut state = self.log.state.lock().unwrap();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::Other, "read failed"));
        }
        let Some(mut chunk) = state.pending.pop_front() else {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.pending.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

/// Hands out transports over one shared fake device
pub(crate) struct ScriptedConnector {
    log: DeviceLog,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self { log: DeviceLog::new() }
    }

    pub fn log(&self) -> DeviceLog {
        self.log.clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&mut self) -> Result<SerialTransport> {
        {
            let mut state = self.log.state.lock().unwrap();
            if state.fail_open {
                return Err(ArmError::Io(io::Error::new(io::ErrorKind::NotFound, "no such device")));
            }
            state.opens += 1;
        }
        let port = ScriptedPort { log: self.log.clone() };
        Ok(SerialTransport::new(Box::new(port), Duration::from_millis(1), "scripted"))
    }
}
