//! Configuration loading using Figment
//!
//! Every path the sampler touches is derived from a single base directory (the optional
//! positional argument, default `./`), see [`Paths`]. Settings are loaded from:
//! 1. `<base>/stream_ocr.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `STREAM_OCR_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use stream_ocr::config::{Paths, Settings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let paths = Paths::new(None);
//! let settings = Settings::load(&paths)?;
//! settings.validate()?;
//! println!("Sampling {}", settings.stream_url);
//! # Ok(())
//! # }
//! ```
//!
//! Example file:
//!
//! ```toml
//! stream_url = "rtsp://10.0.0.7/live"
//! language = "eng+chi_sim"
//! save_first_frame = true
//!
//! [source]
//! width = 1920
//! height = 1080
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, OcrError};
use crate::logging::OutputFormat;

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "STREAM_OCR_";

/// URL scheme selecting the synthetic frame source.
pub const MOCK_SCHEME: &str = "mock://";

/// Filesystem layout below the base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Layout rooted at `base`, or at the current directory.
    pub fn new(base: Option<PathBuf>) -> Self {
        Self {
            base: base.unwrap_or_else(|| PathBuf::from("./")),
        }
    }

    /// The base directory itself.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.base.join("stream_ocr.toml")
    }

    /// Declarative data point list.
    pub fn datapoints_file(&self) -> PathBuf {
        self.base.join("dpConfig")
    }

    /// Recognition model directory.
    pub fn recognition_data(&self) -> PathBuf {
        self.base.join("tessdata")
    }

    /// Log directory, used when logging to file.
    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Where the first frame after each connection is dumped.
    pub fn snapshot_file(&self) -> PathBuf {
        self.base.join("snapshot.pgm")
    }
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Stream endpoint. `mock://` selects the synthetic source.
    #[serde(default)]
    pub stream_url: String,
    /// Recognition language tag, `+`-joined for several
    #[serde(default = "default_language")]
    pub language: String,
    /// Dump the first frame after every connect to `snapshot.pgm`
    #[serde(default)]
    pub save_first_frame: bool,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    /// How often the measured source rate is refreshed
    #[serde(default = "default_rate_refresh_interval")]
    pub rate_refresh_interval_ms: u64,
    /// How often the data point list is checked for changes
    #[serde(default = "default_reload_check_interval")]
    pub reload_check_interval_ms: u64,
    /// Frame source settings
    #[serde(default)]
    pub source: SourceSettings,
    /// Recognition engine settings
    #[serde(default)]
    pub recognition: RecognitionSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Frame source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Output frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Output frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Rate assumed before any frame has been measured
    #[serde(default = "default_nominal_fps")]
    pub nominal_fps: f64,
    /// Longest wait for one frame before the connection counts as lost
    #[serde(default = "default_grab_timeout")]
    pub grab_timeout_ms: u64,
    /// Decoder executable
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

/// Recognition engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionSettings {
    /// Recognizer executable
    #[serde(default = "default_recognizer")]
    pub program: String,
    /// Page segmentation mode passed to the recognizer, if any
    #[serde(default)]
    pub page_segmentation_mode: Option<u8>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Write to `<base>/logs/stream_ocr.log` instead of stderr
    #[serde(default)]
    pub to_file: bool,
}

// Default value functions
fn default_language() -> String {
    "eng".to_string()
}

fn default_reconnect_interval() -> u64 {
    1000
}

fn default_rate_refresh_interval() -> u64 {
    5000
}

fn default_reload_check_interval() -> u64 {
    1000
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_nominal_fps() -> f64 {
    25.0
}

fn default_grab_timeout() -> u64 {
    5000
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_recognizer() -> String {
    "tesseract".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            nominal_fps: default_nominal_fps(),
            grab_timeout_ms: default_grab_timeout(),
            ffmpeg: default_ffmpeg(),
        }
    }
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            program: default_recognizer(),
            page_segmentation_mode: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            to_file: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            language: default_language(),
            save_first_frame: false,
            reconnect_interval_ms: default_reconnect_interval(),
            rate_refresh_interval_ms: default_rate_refresh_interval(),
            reload_check_interval_ms: default_reload_check_interval(),
            source: SourceSettings::default(),
            recognition: RecognitionSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Load `<base>/stream_ocr.toml` merged with `STREAM_OCR_` environment variables
    ///
    /// Example: `STREAM_OCR_LOGGING__LEVEL=debug`, `STREAM_OCR_STREAM_URL=rtsp://...`
    pub fn load(paths: &Paths) -> AppResult<Self> {
        Self::load_from(paths.settings_file())
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if self.stream_url.trim().is_empty() {
            return Err(OcrError::Configuration(
                "stream_url must be set".to_string(),
            ));
        }

        if self.language.trim().is_empty() {
            return Err(OcrError::Configuration("language must not be empty".to_string()));
        }

        let intervals = [
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("rate_refresh_interval_ms", self.rate_refresh_interval_ms),
            ("reload_check_interval_ms", self.reload_check_interval_ms),
            ("source.grab_timeout_ms", self.source.grab_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(OcrError::Configuration(format!("{name} must be positive")));
            }
        }

        if self.source.width == 0 || self.source.height == 0 {
            return Err(OcrError::Configuration(format!(
                "Invalid frame size {}x{}",
                self.source.width, self.source.height
            )));
        }

        if !(self.source.nominal_fps.is_finite() && self.source.nominal_fps > 0.0) {
            return Err(OcrError::Configuration(format!(
                "Invalid nominal_fps {}",
                self.source.nominal_fps
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(OcrError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Delay between reconnect attempts.
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Source rate refresh period.
    pub fn rate_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.rate_refresh_interval_ms)
    }

    /// Data point list check period.
    pub fn reload_check_interval(&self) -> Duration {
        Duration::from_millis(self.reload_check_interval_ms)
    }

    /// True when the synthetic source should be used.
    pub fn uses_mock_source(&self) -> bool {
        self.stream_url.starts_with(MOCK_SCHEME)
    }
}
