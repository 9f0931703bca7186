//! Event channel speaking the supervisor event-listener protocol.
//!
//! The listener handshake runs over stdin/stdout. Each cycle this side
//! writes `READY`, the supervisor sends a header line plus a `len`-byte
//! payload, and this side acknowledges with `RESULT 2\nOK`. Stdout belongs
//! to the protocol, so all diagnostics go to the logging layer instead.
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use thiserror::Error;
use tracing::debug;

use crate::service::ProcessState;

/// Errors from the event-listener channel.
#[derive(Debug, Error)]
pub enum EventChannelError {
    #[error("event channel i/o error: {0}")]
    Io(#[from] io::Error),

    /// The supervisor closed our stdin.
    #[error("event channel closed by peer")]
    Closed,

    #[error("malformed event header: {0}")]
    MalformedHeader(String),
}

/// Decoded body of one event notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A `PROCESS_STATE_*` transition for a single process.
    ProcessState {
        process: String,
        from_state: Option<ProcessState>,
        state: ProcessState,
    },
    /// Any other event type; carried for logging only.
    Other(String),
}

/// One event notification as received from the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The full event name, e.g. `PROCESS_STATE_RUNNING`.
    pub name: String,
    pub kind: EventKind,
}

/// Framed reader/writer for the listener protocol.
pub struct EventChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> EventChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Signals readiness for the next event.
    pub fn ready(&mut self) -> Result<(), EventChannelError> {
        self.writer.write_all(b"READY\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads and decodes the next event notification.
    pub fn next_event(&mut self) -> Result<Event, EventChannelError> {
        let mut header_line = String::new();
        if self.reader.read_line(&mut header_line)? == 0 {
            return Err(EventChannelError::Closed);
        }

        let headers = parse_tokens(header_line.trim_end())?;
        let name = headers
            .get("eventname")
            .ok_or_else(|| {
                EventChannelError::MalformedHeader(format!(
                    "missing eventname in '{}'",
                    header_line.trim_end()
                ))
            })?
            .clone();
        let len: usize = headers
            .get("len")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                EventChannelError::MalformedHeader(format!(
                    "missing or invalid len in '{}'",
                    header_line.trim_end()
                ))
            })?;

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        let payload = String::from_utf8_lossy(&payload);
        debug!("Received event: {name} ({payload})");

        // Payload headers occupy the first line; some event types append a
        // data section after it which is irrelevant here.
        let first_line = payload.lines().next().unwrap_or_default();
        let fields = parse_tokens(first_line)?;

        let kind = match name
            .strip_prefix("PROCESS_STATE_")
            .and_then(|statename| statename.parse::<ProcessState>().ok())
        {
            Some(state) => {
                let process = fields.get("processname").cloned().ok_or_else(|| {
                    EventChannelError::MalformedHeader(format!(
                        "missing processname in payload of '{name}'"
                    ))
                })?;
                let from_state = fields
                    .get("from_state")
                    .and_then(|v| v.parse::<ProcessState>().ok());
                EventKind::ProcessState {
                    process,
                    from_state,
                    state,
                }
            }
            None => EventKind::Other(name.clone()),
        };

        Ok(Event { name, kind })
    }

    /// Acknowledges the event just processed.
    pub fn ack(&mut self) -> Result<(), EventChannelError> {
        self.writer.write_all(b"RESULT 2\nOK")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Splits a line of space-separated `key:value` tokens.
fn parse_tokens(line: &str) -> Result<BTreeMap<String, String>, EventChannelError> {
    let mut tokens = BTreeMap::new();
    for token in line.split_ascii_whitespace() {
        let (key, value) = token.split_once(':').ok_or_else(|| {
            EventChannelError::MalformedHeader(format!("token without ':' in '{line}'"))
        })?;
        tokens.insert(key.to_string(), value.to_string());
    }
    Ok(tokens)
}
