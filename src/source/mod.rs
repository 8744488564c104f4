//! Frame source collaborators.
//!
//! A [`FrameSource`] wraps one connection to a live stream. The hub drives it with the
//! grab/retrieve split: `grab` pulls the next frame off the wire as cheaply as possible
//! and `retrieve` decodes the last grabbed frame into a [`Frame`]. The hub grabs every
//! frame to keep the source's backlog empty and retrieves only the ones it publishes.
//!
//! Implementations:
//! - [`FfmpegSource`]: decodes any URL `ffmpeg` understands (RTSP, HTTP, files).
//! - [`MockFrameSource`]: synthetic frames with injectable faults, for tests and dry runs.

pub mod ffmpeg;
pub mod mock;

use std::time::Instant;

use crate::error::AppResult;
use crate::frame::Frame;

pub use ffmpeg::FfmpegSource;
pub use mock::{MockFrameSource, MockSourceControl};

/// Connection to a live frame stream.
pub trait FrameSource: Send {
    /// Connect to `url`, replacing any previous connection.
    fn open(&mut self, url: &str) -> AppResult<()>;

    /// Advance to the next frame. Failure means the connection is lost.
    fn grab(&mut self) -> AppResult<()>;

    /// Decode the most recently grabbed frame.
    fn retrieve(&mut self) -> AppResult<Frame>;

    /// Frames per second the source currently delivers.
    fn measured_rate(&self) -> f64;

    /// Drop the connection. Safe to call when not connected.
    fn release(&mut self);
}

/// Exponentially smoothed frame arrival rate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    nominal: f64,
    smoothing: f64,
    last: Option<Instant>,
    rate: Option<f64>,
}

impl RateMeter {
    /// Meter reporting `nominal` until two arrivals have been seen.
    pub fn new(nominal: f64) -> Self {
        Self {
            nominal,
            smoothing: 0.1,
            last: None,
            rate: None,
        }
    }

    /// Record one arrival at `at`.
    pub fn record(&mut self, at: Instant) {
        if let Some(last) = self.last {
            let dt = at.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instant_rate = 1.0 / dt;
                self.rate = Some(match self.rate {
                    Some(rate) => rate + self.smoothing * (instant_rate - rate),
                    None => instant_rate,
                });
            }
        }
        self.last = Some(at);
    }

    /// Current estimate in frames per second.
    pub fn rate(&self) -> f64 {
        self.rate.unwrap_or(self.nominal)
    }

    /// Forget all arrivals, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last = None;
        self.rate = None;
    }
}
