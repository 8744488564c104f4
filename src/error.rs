//! Custom error types for the application.
//!
//! This module defines the primary error type, `OcrError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures the sampler can run into, from configuration issues
//! to a dropped stream connection or a failed recognition pass.
//!
//! ## Error Hierarchy
//!
//! - **Configuration** (`Config`, `Configuration`, `DatapointColumnMissing`,
//!   `DatapointParse`): missing or malformed files. Fatal during the initial load, skipped
//!   during a live reload.
//! - **Connection** (`SourceOpen`, `Capture`): the stream could not be opened or a read
//!   failed. These drive the reconnect state machine and never end the process.
//! - **Recognition** (`EngineInit`, `Recognition`, `RegionOutOfBounds`): per-tick failures.
//!   The tick is skipped and the consumer keeps running. An engine that cannot be
//!   initialised fails the consumer's `start`.
//! - **Invalid runtime parameters** (`InvalidInterval`): rejected at the call site, the
//!   previous value stays in effect.
//! - **Lifecycle** (`StartFailed`): a component could not be started; the application
//!   treats this as fatal.
//!
//! By using `#[from]`, `OcrError` can be created from the underlying error types,
//! so `?` works across file, JSON and figment boundaries.

use thiserror::Error;

use crate::frame::Region;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, OcrError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Data point list is missing the '{0}' column")]
    DatapointColumnMissing(&'static str),

    #[error("Data point list row {row}: {message}")]
    DatapointParse { row: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unable to open stream '{url}': {message}")]
    SourceOpen { url: String, message: String },

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Recognition engine init failed for language '{language}': {message}")]
    EngineInit { language: String, message: String },

    #[error("Recognition failed: {0}")]
    Recognition(String),

    #[error("Region {region} exceeds frame bounds {width}x{height}")]
    RegionOutOfBounds {
        region: Region,
        width: u32,
        height: u32,
    },

    #[error("Polling interval must be positive")]
    InvalidInterval,

    #[error("Failed to start {0}")]
    StartFailed(String),
}

impl From<figment::Error> for OcrError {
    fn from(value: figment::Error) -> Self {
        OcrError::Config(Box::new(value))
    }
}

impl OcrError {
    /// Whether the failure is expected to be transient.
    ///
    /// Recoverable errors are logged and the component degrades gracefully; the rest
    /// abort whatever operation produced them.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OcrError::SourceOpen { .. }
                | OcrError::Capture(_)
                | OcrError::Recognition(_)
                | OcrError::RegionOutOfBounds { .. }
                | OcrError::InvalidInterval
        )
    }
}
