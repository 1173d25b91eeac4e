use crate::transport::{LineTransport, RawLine, ReadOutcome, TransportError};
use heapless::Vec;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

pub const OK_SENTINEL: &str = "OK";
pub const PROBE_COMMAND: &str = "AT";
pub const DEFAULT_MAX_READ_ATTEMPTS: usize = 10;

/// Hard ceiling on the read budget; also the capacity of a [`QueryResult`].
pub const MAX_READ_ATTEMPTS: usize = 32;

/// Data lines collected by one query, in arrival order.
pub type QueryResult = Vec<RawLine, MAX_READ_ATTEMPTS>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no result from query {0:?}")]
    NoResult(String),
    #[error("timeout from query {0:?}")]
    Timeout(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Issues AT commands and collects reply lines up to the `OK` sentinel.
#[derive(Debug)]
pub struct QueryEngine<T> {
    transport: T,
    read_timeout: Duration,
    max_read_attempts: usize,
}

impl<T: LineTransport> QueryEngine<T> {
    pub fn new(transport: T, read_timeout: Duration) -> Self {
        Self {
            transport,
            read_timeout,
            max_read_attempts: DEFAULT_MAX_READ_ATTEMPTS,
        }
    }

    /// Set the per-query read budget, clamped to `1..=MAX_READ_ATTEMPTS`.
    pub fn with_max_read_attempts(mut self, attempts: usize) -> Self {
        self.max_read_attempts = attempts.clamp(1, MAX_READ_ATTEMPTS);
        self
    }

    pub fn max_read_attempts(&self) -> usize {
        self.max_read_attempts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send `command` and return its data lines.
    ///
    /// Empty lines spend a read attempt but are neither data nor termination.
    /// A bare `OK` is treated as a protocol violation since every telemetry
    /// query is expected to produce at least one line.
    pub fn query(&mut self, command: &str) -> Result<QueryResult, ProtocolError> {
        self.transport.write_command(command)?;

        let mut results = QueryResult::new();
        for attempt in 0..self.max_read_attempts {
            let line = match self.transport.read_line(self.read_timeout)? {
                ReadOutcome::Line(line) => line,
                ReadOutcome::Timeout => {
                    trace!(attempt, command, "read timed out");
                    continue;
                }
            };

            if line.is_empty() {
                continue;
            }

            if line == OK_SENTINEL {
                if results.is_empty() {
                    return Err(ProtocolError::NoResult(command.to_string()));
                }
                debug!(command, lines = results.len(), "query complete");
                return Ok(results);
            }

            // Capacity equals the attempt ceiling, so this cannot overflow.
            let _ = results.push(line);
        }

        Err(ProtocolError::Timeout(command.to_string()))
    }

    /// Check that the modem answers `AT` with `OK` within the read budget.
    ///
    /// Echoes and unsolicited lines before the sentinel are ignored.
    pub fn probe(&mut self) -> Result<(), ProtocolError> {
        self.transport.write_command(PROBE_COMMAND)?;

        for _ in 0..self.max_read_attempts {
            match self.transport.read_line(self.read_timeout)? {
                ReadOutcome::Line(line) if line == OK_SENTINEL => return Ok(()),
                ReadOutcome::Line(line) => trace!(line = %line, "probe reply"),
                ReadOutcome::Timeout => {}
            }
        }

        Err(ProtocolError::Timeout(PROBE_COMMAND.to_string()))
    }
}
