//! Declarative data point list.
//!
//! The list is a JSON table: the first element is the header row of column names, every
//! further element a data row with values in header order.
//!
//! ```json
//! [
//!   ["dpId", "pollingInterval", "coordinateDetail", "description"],
//!   ["boiler_temp", "1000", "{\"x\":10,\"y\":20,\"width\":120,\"height\":40}", "boiler"],
//!   ["line_speed", "500", {"x":0,"y":0,"width":0,"height":0}, ""]
//! ]
//! ```
//!
//! Required columns are `dpId`, `pollingInterval` and `coordinateDetail`; any other column
//! is ignored. `pollingInterval` is a decimal string (a bare integer is accepted too) and
//! `coordinateDetail` is an object, or a string holding one, with integer `x`, `y`,
//! `width` and `height`.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use crate::error::{AppResult, OcrError};
use crate::frame::Region;

const COL_ID: &str = "dpId";
const COL_INTERVAL: &str = "pollingInterval";
const COL_REGION: &str = "coordinateDetail";

/// One row of the data point list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPointConfig {
    /// Unique data point id
    pub dp_id: String,
    /// Polling interval in milliseconds, as written (0 is kept and rejected later)
    pub polling_interval_ms: u64,
    /// Region of interest
    pub coordinate_detail: Region,
}

impl DataPointConfig {
    /// Build a record.
    pub fn new(dp_id: impl Into<String>, polling_interval_ms: u64, region: Region) -> Self {
        Self {
            dp_id: dp_id.into(),
            polling_interval_ms,
            coordinate_detail: region,
        }
    }

    /// True when interval and region match. The id is not compared.
    pub fn same_settings(&self, other: &Self) -> bool {
        self.polling_interval_ms == other.polling_interval_ms
            && self.coordinate_detail == other.coordinate_detail
    }
}

/// Read and parse the list at `path`.
pub fn load_datapoints(path: &Path) -> AppResult<Vec<DataPointConfig>> {
    let text = std::fs::read_to_string(path)?;
    parse_datapoints(&text)
}

/// Parse the list from JSON text.
pub fn parse_datapoints(text: &str) -> AppResult<Vec<DataPointConfig>> {
    let table: Value = serde_json::from_str(text)?;
    let rows = table.as_array().ok_or_else(|| OcrError::DatapointParse {
        row: 0,
        message: "expected a JSON array of rows".into(),
    })?;

    let header = rows
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| OcrError::DatapointParse {
            row: 0,
            message: "missing header row".into(),
        })?;

    let column = |name: &'static str| {
        header
            .iter()
            .position(|cell| cell.as_str() == Some(name))
            .ok_or(OcrError::DatapointColumnMissing(name))
    };
    let id_col = column(COL_ID)?;
    let interval_col = column(COL_INTERVAL)?;
    let region_col = column(COL_REGION)?;

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
    for (row, cells) in rows.iter().enumerate().skip(1) {
        let fail = |message: String| OcrError::DatapointParse { row, message };
        let cells = cells
            .as_array()
            .ok_or_else(|| fail("row is not an array".into()))?;
        let cell = |col: usize, name: &str| {
            cells
                .get(col)
                .ok_or_else(|| fail(format!("missing '{name}' value")))
        };

        let dp_id = cell(id_col, COL_ID)?
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| fail("'dpId' must be a non-empty string".into()))?
            .to_string();
        let polling_interval_ms = parse_interval(cell(interval_col, COL_INTERVAL)?).map_err(fail)?;
        let coordinate_detail = parse_region(cell(region_col, COL_REGION)?).map_err(fail)?;

        if !seen.insert(dp_id.clone()) {
            return Err(fail(format!("duplicate dpId '{dp_id}'")));
        }
        records.push(DataPointConfig {
            dp_id,
            polling_interval_ms,
            coordinate_detail,
        });
    }

    Ok(records)
}

fn parse_interval(value: &Value) -> Result<u64, String> {
    match value {
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| format!("invalid pollingInterval '{s}': {e}")),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("invalid pollingInterval {n}")),
        other => Err(format!("invalid pollingInterval {other}")),
    }
}

fn parse_region(value: &Value) -> Result<Region, String> {
    let parsed = match value {
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| format!("invalid coordinateDetail: {e}"))
}
