use arrayvec::ArrayString;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_COMMAND_SIZE: usize = 256;
pub const LINE_TERMINATOR: &str = "\r\n";

// Upper bound on lines discarded by a single drain, so a chattering device
// cannot hold startup hostage.
const MAX_DRAIN_LINES: usize = 1024;
const READ_CHUNK_SIZE: usize = 256;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;

/// A single decoded line with its terminator stripped.
pub type RawLine = String;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("failed to configure port: {0}")]
    Configure(#[source] serialport::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("command of {len} bytes exceeds the {max} byte frame")]
    CommandTooLong { len: usize, max: usize },
    #[error("read timeout of {0:?} is out of range")]
    TimeoutOutOfRange(Duration),
}

/// Result of one bounded read. Silence is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(RawLine),
    Timeout,
}

/// Line-oriented duplex channel to the modem.
///
/// A transport only frames bytes into lines. It never retries and never
/// interprets what it reads; that belongs to [`crate::query::QueryEngine`].
pub trait LineTransport {
    /// Write `command` followed by [`LINE_TERMINATOR`].
    fn write_command(&mut self, command: &str) -> Result<(), TransportError>;

    /// Block for at most `timeout` waiting for one terminated line.
    fn read_line(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError>;

    /// Discard buffered output until a read comes back empty.
    ///
    /// Returns the number of discarded lines.
    fn drain_stale(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let mut drained = 0;
        while drained < MAX_DRAIN_LINES {
            match self.read_line(timeout)? {
                ReadOutcome::Line(line) => {
                    debug!(line = %line, "discarding stale line");
                    drained += 1;
                }
                ReadOutcome::Timeout => return Ok(drained),
            }
        }
        warn!(drained, "stale input did not settle, continuing anyway");
        Ok(drained)
    }
}

/// Frame `command` with the line terminator into a fixed-size buffer.
pub fn frame_command(command: &str) -> Result<CommandBuffer, TransportError> {
    let mut frame = CommandBuffer::new();
    let too_long = || TransportError::CommandTooLong {
        len: command.len() + LINE_TERMINATOR.len(),
        max: MAX_COMMAND_SIZE,
    };
    frame.try_push_str(command).map_err(|_| too_long())?;
    frame.try_push_str(LINE_TERMINATOR).map_err(|_| too_long())?;
    Ok(frame)
}

/// Instant at which a read started at `start` gives up.
fn read_deadline(start: Instant, timeout: Duration) -> Result<Instant, TransportError> {
    start
        .checked_add(timeout)
        .ok_or(TransportError::TimeoutOutOfRange(timeout))
}

/// Remove the first complete line from `pending`, if there is one.
fn split_line(pending: &mut Vec<u8>) -> Option<RawLine> {
    let end = pending.iter().position(|&b| b == b'\n')?;
    let raw: Vec<u8> = pending.drain(..=end).collect();
    let text = String::from_utf8_lossy(&raw);
    Some(text.trim_end_matches(['\r', '\n']).to_string())
}

/// Serial device transport (USB modem AT port).
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|source| TransportError::Open {
                path: path.to_string(),
                source,
            })?;

        info!(device = path, baud_rate, "serial transport open");

        Ok(Self {
            port,
            pending: Vec::with_capacity(READ_CHUNK_SIZE),
        })
    }
}

impl LineTransport for SerialTransport {
    fn write_command(&mut self, command: &str) -> Result<(), TransportError> {
        let frame = frame_command(command)?;
        self.port
            .write_all(frame.as_bytes())
            .map_err(TransportError::Write)?;
        self.port.flush().map_err(TransportError::Write)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportError> {
        let deadline = read_deadline(Instant::now(), timeout)?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            if let Some(line) = split_line(&mut self.pending) {
                return Ok(ReadOutcome::Line(line));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadOutcome::Timeout);
            }
            self.port
                .set_timeout(deadline - now)
                .map_err(TransportError::Configure)?;

            match self.port.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Timeout),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(ReadOutcome::Timeout),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Read(e)),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Line(RawLine),
    Silence,
}

/// In-memory transport that replays a fixed script of replies.
///
/// Once the script runs out every read times out. Written commands are kept
/// so callers can check what was sent.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: VecDeque<ScriptStep>,
    written: Vec<String>,
    fail_writes: bool,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut transport = Self::new();
        for line in lines {
            transport.push_line(line);
        }
        transport
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.steps.push_back(ScriptStep::Line(line.into()));
    }

    pub fn push_silence(&mut self) {
        self.steps.push_back(ScriptStep::Silence);
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl LineTransport for ScriptedTransport {
    fn write_command(&mut self, command: &str) -> Result<(), TransportError> {
        frame_command(command)?;
        if self.fail_writes {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted write failure",
            )));
        }
        self.written.push(command.to_string());
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<ReadOutcome, TransportError> {
        match self.steps.pop_front() {
            Some(ScriptStep::Line(line)) => Ok(ReadOutcome::Line(line)),
            Some(ScriptStep::Silence) | None => Ok(ReadOutcome::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_line_strips_terminators() {
        let mut pending = b"OK\r\n+QENG: partial".to_vec();
        assert_eq!(split_line(&mut pending).as_deref(), Some("OK"));
        assert_eq!(split_line(&mut pending), None);
        assert_eq!(pending, b"+QENG: partial".to_vec());
    }

    #[test]
    fn split_line_yields_empty_line_for_bare_terminator() {
        let mut pending = b"\r\nOK\r\n".to_vec();
        assert_eq!(split_line(&mut pending).as_deref(), Some(""));
        assert_eq!(split_line(&mut pending).as_deref(), Some("OK"));
        assert!(pending.is_empty());
    }

    #[test]
    fn frame_command_appends_terminator() {
        let frame = frame_command("AT").unwrap();
        assert_eq!(frame.as_str(), "AT\r\n");
    }

    #[test]
    fn frame_command_rejects_oversized_command() {
        let command = "A".repeat(MAX_COMMAND_SIZE);
        assert!(matches!(
            frame_command(&command),
            Err(TransportError::CommandTooLong { .. })
        ));
    }

    #[test]
    fn read_deadline_rejects_overflowing_timeout() {
        let start = Instant::now();
        assert_eq!(
            read_deadline(start, Duration::from_millis(250)).unwrap(),
            start + Duration::from_millis(250)
        );
        assert!(matches!(
            read_deadline(start, Duration::MAX),
            Err(TransportError::TimeoutOutOfRange(_))
        ));
    }

    #[test]
    fn drain_is_bounded_for_a_chattering_device() {
        let extra = 5;
        let mut transport =
            ScriptedTransport::with_lines((0..MAX_DRAIN_LINES + extra).map(|i| format!("+CREG: {i}")));

        let drained = transport.drain_stale(Duration::from_millis(10)).unwrap();
        assert_eq!(drained, MAX_DRAIN_LINES);
        assert_eq!(transport.remaining(), extra);
    }

    #[test]
    fn drain_stops_at_first_silence() {
        let mut transport = ScriptedTransport::with_lines(["RDY", "+CPIN: READY"]);
        transport.push_silence();
        transport.push_line("late");

        let drained = transport.drain_stale(Duration::from_millis(10)).unwrap();
        assert_eq!(drained, 2);
        assert_eq!(transport.remaining(), 1);
    }
}
