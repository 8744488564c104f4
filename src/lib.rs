//! # stream_ocr
//!
//! Reads text out of regions of a live video stream.
//!
//! One [`hub::FrameHub`] keeps a single connection to the stream and publishes a
//! down-sampled snapshot. Each configured data point becomes a
//! [`consumer::SampledConsumer`] that, on its own schedule, crops its region out of the
//! latest snapshot, runs text recognition over it and emits a JSON line
//! `{"dpId", "time", "value"}` on standard output. The data point list is watched on
//! disk and applied live, and an optional process-level [`watchdog`] restarts the worker
//! when it crashes.
//!
//! ## Crate Structure
//!
//! - **`lifecycle`**: the hierarchical start/stop protocol every component follows.
//! - **`scheduler`**: periodic and continuous task runners on dedicated threads.
//! - **`frame`**: grayscale frames and regions of interest.
//! - **`source`**: the frame source collaborator (`ffmpeg` and a mock).
//! - **`hub`**: connection state machine, stride computation and the snapshot slot.
//! - **`recognition`**: the recognition engine collaborator (`tesseract` and a mock).
//! - **`consumer`**: per data point consumers.
//! - **`sink`**: where readings go.
//! - **`datapoints`**: the on-disk data point list.
//! - **`reconcile`**: live reconfiguration from that list.
//! - **`app`**: the root of the component tree.
//! - **`watchdog`**: crash restarts and signal relaying at process level.
//! - **`config`**, **`logging`**, **`error`**: settings, tracing setup and the error type.

pub mod app;
pub mod config;
pub mod consumer;
pub mod datapoints;
pub mod error;
pub mod frame;
pub mod hub;
pub mod lifecycle;
pub mod logging;
pub mod recognition;
pub mod reconcile;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod watchdog;

pub use app::App;
pub use error::{AppResult, OcrError};
pub use lifecycle::{Lifecycle, LifecycleNode};
