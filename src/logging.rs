//! Tracing Infrastructure
//!
//! Structured logging for the sampler built on `tracing` and `tracing-subscriber`:
//! - Structured events with fields (`dp_id`, `url`, `scheduler`, ...)
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//! - Output to stderr, or to `<base>/logs/stream_ocr.log`
//!
//! Standard output belongs to the result sink, so log lines never go there.
//!
//! # Example
//! ```no_run
//! use stream_ocr::config::{Paths, Settings};
//! use stream_ocr::logging::{self, TracingConfig};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = Paths::new(None);
//! let settings = Settings::load(&paths)?;
//! logging::init(TracingConfig::from_settings(&settings.logging, &paths)?)?;
//!
//! info!("Sampler started");
//! warn!(dp_id = "temp_1", "Polling interval rejected");
//! # Ok(())
//! # }
//! ```

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::{LoggingSettings, Paths};
use crate::error::{AppResult, OcrError};

/// Log file name below the log directory.
pub const LOG_FILE_NAME: &str = "stream_ocr.log";

/// Output format for tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format (for production)
    #[default]
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format on a terminal)
    pub with_ansi: bool,
    /// Append to this file instead of writing to stderr
    pub log_file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
            log_file: None,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the `[logging]` settings
    pub fn from_settings(settings: &LoggingSettings, paths: &Paths) -> AppResult<Self> {
        let level = parse_log_level(&settings.level)?;
        let log_file = settings
            .to_file
            .then(|| paths.log_dir().join(LOG_FILE_NAME));

        Ok(Self {
            level,
            format: settings.format,
            with_ansi: log_file.is_none(),
            log_file,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Write to a file instead of stderr
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self.with_ansi = false;
        self
    }
}

/// Initialize tracing with the given configuration
///
/// This function is idempotent - if tracing is already initialized, it returns `Ok(())`
/// without error. This makes it safe to call from tests and from the worker process
/// after the supervisor has already logged.
pub fn init(config: TracingConfig) -> AppResult<()> {
    // Create env filter with default level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let writer = match &config.log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let file = File::options().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let base = fmt::layer()
        .with_writer(writer)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    // Build subscriber based on format
    let fmt_layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // "already initialized" is expected in tests
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(OcrError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        })
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(OcrError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
