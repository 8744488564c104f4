//! Mock recognition engine for tests and dry runs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AppResult, OcrError};
use crate::frame::Frame;
use crate::recognition::{EngineFactory, RecognitionEngine};

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    recognized: AtomicUsize,
    fail_init: AtomicBool,
    fail_recognition: AtomicBool,
}

/// Factory producing engines that answer with fixed text.
///
/// Clones share counters and failure switches, so a test can keep one clone and hand
/// another to the code under test.
#[derive(Debug, Clone)]
pub struct MockEngineFactory {
    text: Arc<Mutex<String>>,
    counters: Arc<Counters>,
    sizes: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl MockEngineFactory {
    /// Engines recognise every image as `text`.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Arc::new(Mutex::new(text.into())),
            counters: Arc::new(Counters::default()),
            sizes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make engine creation fail (or succeed again).
    pub fn set_fail_init(&self, fail: bool) {
        self.counters.fail_init.store(fail, Ordering::SeqCst);
    }

    /// Make every recognition call fail (or succeed again).
    pub fn set_fail_recognition(&self, fail: bool) {
        self.counters.fail_recognition.store(fail, Ordering::SeqCst);
    }

    /// Change the text returned from now on.
    pub fn set_text(&self, text: impl Into<String>) {
        *self.text.lock() = text.into();
    }

    /// Engines created so far.
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    /// Successful recognitions so far.
    pub fn recognized(&self) -> usize {
        self.counters.recognized.load(Ordering::SeqCst)
    }

    /// Dimensions of every image passed to a successful recognition.
    pub fn image_sizes(&self) -> Vec<(u32, u32)> {
        self.sizes.lock().clone()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, _data_path: &Path, language: &str) -> AppResult<Box<dyn RecognitionEngine>> {
        if self.counters.fail_init.load(Ordering::SeqCst) {
            return Err(OcrError::EngineInit {
                language: language.to_string(),
                message: "mock init failure".into(),
            });
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            factory: self.clone(),
        }))
    }
}

struct MockEngine {
    factory: MockEngineFactory,
}

impl RecognitionEngine for MockEngine {
    fn recognize(&mut self, image: &Frame) -> AppResult<String> {
        if self.factory.counters.fail_recognition.load(Ordering::SeqCst) {
            return Err(OcrError::Recognition("mock recognition failure".into()));
        }
        self.factory.sizes.lock().push((image.width, image.height));
        self.factory.counters.recognized.fetch_add(1, Ordering::SeqCst);
        Ok(self.factory.text.lock().clone())
    }
}
