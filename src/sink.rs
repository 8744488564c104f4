//! Result records and where they go.

use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::AppResult;

/// One recognition result.
///
/// Serialises to `{"dpId": ..., "time": <ms since epoch>, "value": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Data point the value belongs to
    #[serde(rename = "dpId")]
    pub dp_id: String,
    /// Wall-clock time of the tick, milliseconds since the Unix epoch
    pub time: i64,
    /// Recognised text, trailing newlines removed
    pub value: String,
}

/// Destination for readings. Shared by every consumer.
pub trait ResultSink: Send + Sync {
    /// Deliver one reading.
    fn emit(&self, reading: &Reading) -> AppResult<()>;
}

/// Writes one JSON object per line to standard output.
#[derive(Debug, Default)]
pub struct JsonLinesSink;

impl JsonLinesSink {
    /// Sink writing to stdout.
    pub fn new() -> Self {
        Self
    }
}

impl ResultSink for JsonLinesSink {
    fn emit(&self, reading: &Reading) -> AppResult<()> {
        let line = serde_json::to_string(reading)?;
        // One locked write per record keeps lines from different consumers intact.
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

/// Keeps readings in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    readings: Mutex<Vec<Reading>>,
}

impl CollectingSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything received so far.
    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().clone()
    }

    /// Readings for one data point.
    pub fn readings_for(&self, dp_id: &str) -> Vec<Reading> {
        self.readings
            .lock()
            .iter()
            .filter(|r| r.dp_id == dp_id)
            .cloned()
            .collect()
    }

    /// Number of readings received.
    pub fn len(&self) -> usize {
        self.readings.lock().len()
    }

    /// True when nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.readings.lock().is_empty()
    }
}

impl ResultSink for CollectingSink {
    fn emit(&self, reading: &Reading) -> AppResult<()> {
        self.readings.lock().push(reading.clone());
        Ok(())
    }
}

/// Emit and log failures; a lost reading never stops a consumer.
pub(crate) fn emit_logged(sink: &dyn ResultSink, reading: &Reading) {
    if let Err(e) = sink.emit(reading) {
        error!(dp_id = %reading.dp_id, error = %e, "failed to emit reading");
    }
}
