//! Mock frame source for testing without a live stream.
//!
//! Produces synthetic grayscale frames at a fixed rate. Every pixel of frame `n` holds
//! `n mod 256`, so tests can tell frames apart. Faults are injected at runtime through a
//! shared [`MockSourceControl`]:
//!
//! ```rust,ignore
//! let source = MockFrameSource::new(64, 48, 50.0);
//! let control = source.control();
//! // ... hand `source` to a hub ...
//! control.disconnect();   // next grab fails, opens fail until reconnect()
//! control.reconnect();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AppResult, OcrError};
use crate::frame::Frame;
use crate::source::FrameSource;

/// Shared fault-injection handle for a [`MockFrameSource`].
#[derive(Debug)]
pub struct MockSourceControl {
    reachable: AtomicBool,
    failing_opens: AtomicU32,
    opens: AtomicU64,
    grabs: AtomicU64,
    reported_fps: Mutex<Option<f64>>,
}

impl MockSourceControl {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            failing_opens: AtomicU32::new(0),
            opens: AtomicU64::new(0),
            grabs: AtomicU64::new(0),
            reported_fps: Mutex::new(None),
        }
    }

    /// Make the stream unreachable: grabs and opens fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.reachable.store(false, Ordering::SeqCst);
    }

    /// Make the stream reachable again.
    pub fn reconnect(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` open attempts even while reachable.
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Report `fps` as the measured rate from now on, whatever the actual frame rate.
    pub fn set_measured_rate(&self, fps: f64) {
        *self.reported_fps.lock() = Some(fps);
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of successful grabs so far.
    pub fn grab_count(&self) -> u64 {
        self.grabs.load(Ordering::SeqCst)
    }

    fn take_open_failure(&self) -> bool {
        self.failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Synthetic frame source.
pub struct MockFrameSource {
    width: u32,
    height: u32,
    fps: f64,
    control: Arc<MockSourceControl>,
    open: bool,
    next_due: Instant,
    sequence: u64,
    grabbed: bool,
}

impl MockFrameSource {
    /// Source producing `width` x `height` frames at `fps` frames per second.
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            control: Arc::new(MockSourceControl::new()),
            open: false,
            next_due: Instant::now(),
            sequence: 0,
            grabbed: false,
        }
    }

    /// Fault-injection handle shared with this source.
    pub fn control(&self) -> Arc<MockSourceControl> {
        Arc::clone(&self.control)
    }

    fn frame_period(&self) -> Duration {
        if self.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.fps)
        } else {
            Duration::ZERO
        }
    }
}

impl FrameSource for MockFrameSource {
    fn open(&mut self, url: &str) -> AppResult<()> {
        self.release();
        if !self.control.reachable.load(Ordering::SeqCst) || self.control.take_open_failure() {
            return Err(OcrError::SourceOpen {
                url: url.to_string(),
                message: "mock stream unreachable".into(),
            });
        }
        self.open = true;
        self.next_due = Instant::now();
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        debug!(url = %url, "mock stream opened");
        Ok(())
    }

    fn grab(&mut self) -> AppResult<()> {
        if !self.open {
            return Err(OcrError::Capture("mock stream is not open".into()));
        }
        if !self.control.reachable.load(Ordering::SeqCst) {
            self.open = false;
            return Err(OcrError::Capture("mock stream dropped".into()));
        }

        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.frame_period();

        self.sequence += 1;
        self.grabbed = true;
        self.control.grabs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn retrieve(&mut self) -> AppResult<Frame> {
        if !std::mem::take(&mut self.grabbed) {
            return Err(OcrError::Capture("retrieve called without a grabbed frame".into()));
        }
        let mut frame = Frame::filled(self.width, self.height, (self.sequence % 256) as u8);
        frame.sequence = self.sequence;
        Ok(frame)
    }

    fn measured_rate(&self) -> f64 {
        let reported = *self.control.reported_fps.lock();
        reported.unwrap_or(self.fps)
    }

    fn release(&mut self) {
        self.open = false;
        self.grabbed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_then_retrieve_yields_distinct_frames() {
        let mut source = MockFrameSource::new(8, 4, 1000.0);
        source.open("mock://test").unwrap();

        source.grab().unwrap();
        let first = source.retrieve().unwrap();
        source.grab().unwrap();
        let second = source.retrieve().unwrap();

        assert_eq!((first.width, first.height), (8, 4));
        assert_ne!(first.data, second.data);
        assert_eq!(second.sequence, first.sequence + 1);
        assert!(source.retrieve().is_err());
    }

    #[test]
    fn disconnect_fails_grab_and_open_until_reconnect() {
        let mut source = MockFrameSource::new(8, 4, 1000.0);
        let control = source.control();
        source.open("mock://test").unwrap();

        control.disconnect();
        assert!(source.grab().is_err());
        assert!(source.open("mock://test").is_err());

        control.reconnect();
        source.open("mock://test").unwrap();
        source.grab().unwrap();
        assert_eq!(control.open_count(), 2);
    }

    #[test]
    fn injected_open_failures_are_consumed() {
        let mut source = MockFrameSource::new(8, 4, 1000.0);
        let control = source.control();
        control.fail_next_opens(2);

        assert!(source.open("mock://test").is_err());
        assert!(source.open("mock://test").is_err());
        assert!(source.open("mock://test").is_ok());
    }

    #[test]
    fn measured_rate_can_be_overridden() {
        let source = MockFrameSource::new(2, 2, 30.0);
        assert_eq!(source.measured_rate(), 30.0);

        source.control().set_measured_rate(12.5);
        assert_eq!(source.measured_rate(), 12.5);
    }

    #[test]
    fn grab_is_paced_to_frame_rate() {
        let mut source = MockFrameSource::new(2, 2, 100.0);
        source.open("mock://test").unwrap();

        let started = Instant::now();
        for _ in 0..6 {
            source.grab().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(45));
    }
}
