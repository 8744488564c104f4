//! `ffmpeg` subprocess frame source.
//!
//! The stream is decoded by an `ffmpeg` child process to raw 8-bit grayscale at a fixed
//! output size. A reader thread slices stdout into whole frames and hands them over a
//! small bounded channel, so a slow sampler applies backpressure to the decoder instead
//! of letting frames pile up.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::SourceSettings;
use crate::error::{AppResult, OcrError};
use crate::frame::Frame;
use crate::source::{FrameSource, RateMeter};

const QUEUE_DEPTH: usize = 2;

struct Session {
    url: String,
    child: Child,
    frames: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
}

/// Frame source backed by an `ffmpeg` child process.
pub struct FfmpegSource {
    program: String,
    width: u32,
    height: u32,
    grab_timeout: Duration,
    session: Option<Session>,
    grabbed: Option<Vec<u8>>,
    sequence: u64,
    meter: RateMeter,
}

impl FfmpegSource {
    /// Create a disconnected source from the `[source]` settings.
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            program: settings.ffmpeg.clone(),
            width: settings.width,
            height: settings.height,
            grab_timeout: Duration::from_millis(settings.grab_timeout_ms),
            session: None,
            grabbed: None,
            sequence: 0,
            meter: RateMeter::new(settings.nominal_fps),
        }
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(url)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("gray")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    fn receive(&self, session: &Session, timeout: Duration) -> AppResult<Vec<u8>> {
        match session.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(OcrError::Capture(format!(
                "no frame from '{}' within {timeout:?}",
                session.url
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(OcrError::Capture(format!(
                "stream '{}' ended",
                session.url
            ))),
        }
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self, url: &str) -> AppResult<()> {
        self.release();

        let source_open = |message: String| OcrError::SourceOpen {
            url: url.to_string(),
            message,
        };

        let mut child = self
            .command(url)
            .spawn()
            .map_err(|e| source_open(format!("failed to spawn {}: {e}", self.program)))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(source_open("ffmpeg stdout was not captured".into()));
        };

        let (tx, rx) = bounded(QUEUE_DEPTH);
        let frame_bytes = self.frame_bytes();
        let reader = thread::Builder::new()
            .name("ffmpeg-reader".into())
            .spawn(move || read_frames(stdout, frame_bytes, tx));
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(source_open(format!("failed to spawn reader thread: {e}")));
            }
        };

        let session = Session {
            url: url.to_string(),
            child,
            frames: rx,
            reader: Some(reader),
        };

        // The connection only counts once a whole frame has been decoded.
        let first = self.receive(&session, self.grab_timeout);
        self.session = Some(session);
        if let Err(e) = first {
            self.release();
            return Err(source_open(e.to_string()));
        }

        self.meter.reset();
        self.meter.record(Instant::now());
        info!(url = %url, width = self.width, height = self.height, "ffmpeg stream opened");
        Ok(())
    }

    fn grab(&mut self) -> AppResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(OcrError::Capture("stream is not open".into()));
        };
        let data = self.receive(session, self.grab_timeout)?;
        self.meter.record(Instant::now());
        self.sequence += 1;
        self.grabbed = Some(data);
        Ok(())
    }

    fn retrieve(&mut self) -> AppResult<Frame> {
        let data = self
            .grabbed
            .take()
            .ok_or_else(|| OcrError::Capture("retrieve called without a grabbed frame".into()))?;
        let mut frame = Frame::new(self.width, self.height, 1, data)?;
        frame.sequence = self.sequence;
        Ok(frame)
    }

    fn measured_rate(&self) -> f64 {
        self.meter.rate()
    }

    fn release(&mut self) {
        self.grabbed = None;
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.child.kill() {
            debug!(error = %e, "ffmpeg already exited");
        }
        if let Err(e) = session.child.wait() {
            warn!(error = %e, "failed to reap ffmpeg");
        }
        // Unblock a reader stuck on a full queue before joining it.
        drop(session.frames);
        if let Some(reader) = session.reader.take() {
            if reader.join().is_err() {
                warn!("ffmpeg reader thread panicked");
            }
        }
        debug!(url = %session.url, "ffmpeg stream released");
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_frames(mut stdout: ChildStdout, frame_bytes: usize, tx: Sender<Vec<u8>>) {
    let mut buffer = vec![0u8; frame_bytes];
    loop {
        if let Err(e) = stdout.read_exact(&mut buffer) {
            debug!(error = %e, "ffmpeg output ended");
            break;
        }
        if tx.send(buffer.clone()).is_err() {
            break;
        }
    }
}
