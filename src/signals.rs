//! Latest-value cells for every telemetry signal and the handlers that feed them.
//!
//! Each signal owns one `watch` channel. The signal's message handler is the
//! only writer; observers hold receivers and never block the writer.

use crate::telemetry_hub::MessageHandler;
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Tank1Level,
    Tank2Level,
    Colony1Flow,
    Colony2Flow,
    /// Generic sensor value kept for older consumers.
    Legacy,
}

impl Signal {
    pub const ALL: [Signal; 5] = [
        Signal::Tank1Level,
        Signal::Tank2Level,
        Signal::Colony1Flow,
        Signal::Colony2Flow,
        Signal::Legacy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Tank1Level => "tank_1_level",
            Signal::Tank2Level => "tank_2_level",
            Signal::Colony1Flow => "colony_1_flow",
            Signal::Colony2Flow => "colony_2_flow",
            Signal::Legacy => "legacy",
        }
    }

    /// Cells written when a reading arrives for this signal.
    ///
    /// Tank 1 and colony 1 also feed the legacy cell; nothing else does.
    pub fn routes(&self) -> &'static [Signal] {
        match self {
            Signal::Tank1Level => &[Signal::Tank1Level, Signal::Legacy],
            Signal::Colony1Flow => &[Signal::Colony1Flow, Signal::Legacy],
            Signal::Tank2Level => &[Signal::Tank2Level],
            Signal::Colony2Flow => &[Signal::Colony2Flow],
            Signal::Legacy => &[Signal::Legacy],
        }
    }

    fn index(&self) -> usize {
        match self {
            Signal::Tank1Level => 0,
            Signal::Tank2Level => 1,
            Signal::Colony1Flow => 2,
            Signal::Colony2Flow => 3,
            Signal::Legacy => 4,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = ReadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signal::ALL
            .into_iter()
            .find(|signal| signal.as_str() == s)
            .ok_or_else(|| ReadingError::UnknownSignal(s.to_string()))
    }
}

/// A successfully parsed value and when it was stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f32,
    pub updated_at: OffsetDateTime,
}

impl Reading {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = OffsetDateTime::now_utc() - self.updated_at;
        age > max_age
    }

    pub fn updated_at_ms(&self) -> i64 {
        (self.updated_at.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadingError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload is empty")]
    Empty,
    #[error("'{0}' is not a valid number")]
    NotANumber(String),
    #[error("unknown signal '{0}'")]
    UnknownSignal(String),
}

/// Decodes a numeric payload: UTF-8, trimmed, finite float.
pub fn parse_reading(payload: &[u8]) -> Result<f32, ReadingError> {
    let text = std::str::from_utf8(payload).map_err(|_| ReadingError::InvalidUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ReadingError::Empty);
    }

    match text.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ReadingError::NotANumber(text.to_string())),
    }
}

pub type CellReceiver = watch::Receiver<Option<Reading>>;

/// The process-wide set of latest-value cells, one per [`Signal`].
#[derive(Debug)]
pub struct SignalCells {
    cells: [watch::Sender<Option<Reading>>; 5],
}

impl Default for SignalCells {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalCells {
    pub fn new() -> Self {
        Self {
            cells: std::array::from_fn(|_| watch::Sender::new(None)),
        }
    }

    pub fn latest(&self, signal: Signal) -> Option<Reading> {
        *self.cells[signal.index()].borrow()
    }

    pub fn subscribe(&self, signal: Signal) -> CellReceiver {
        self.cells[signal.index()].subscribe()
    }

    /// Stores `value` in every cell routed from `signal`.
    pub fn record(&self, signal: Signal, value: f32) {
        let reading = Reading::new(value);
        for target in signal.routes() {
            self.cells[target.index()].send_replace(Some(reading));
        }
    }
}

/// Builds the handler that parses numeric payloads for `signal` into `cells`.
pub fn numeric_handler(cells: Arc<SignalCells>, signal: Signal) -> MessageHandler {
    Arc::new(move |payload: &[u8]| match parse_reading(payload) {
        Ok(value) => {
            debug!("{} - received value {}", signal, value);
            cells.record(signal, value);
        }
        Err(e) => {
            warn!("{} - discarding message: {}", signal, e);
        }
    })
}
