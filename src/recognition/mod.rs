//! Text recognition collaborators.
//!
//! An [`EngineFactory`] performs the expensive engine initialisation; every consumer asks
//! it for a private [`RecognitionEngine`] when it starts and drops that engine when it
//! stops. Engines are `Send` but never shared between consumers.

pub mod mock;
pub mod tesseract;

use std::path::Path;

use crate::error::AppResult;
use crate::frame::Frame;

pub use mock::MockEngineFactory;
pub use tesseract::TesseractFactory;

/// One initialised recognition engine, owned by a single consumer.
pub trait RecognitionEngine: Send {
    /// Recognise the text in `image`.
    fn recognize(&mut self, image: &Frame) -> AppResult<String>;
}

/// Creates recognition engines.
pub trait EngineFactory: Send + Sync {
    /// Initialise an engine with the model data in `data_path` for `language`.
    fn create(&self, data_path: &Path, language: &str) -> AppResult<Box<dyn RecognitionEngine>>;
}
