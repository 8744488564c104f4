//! Recognition through the `tesseract` command-line tool.
//!
//! Each call pipes the image to `tesseract stdin stdout` as a binary PNM, which the CLI
//! reads natively, and collects UTF-8 text from its stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::config::RecognitionSettings;
use crate::error::{AppResult, OcrError};
use crate::frame::Frame;
use crate::recognition::{EngineFactory, RecognitionEngine};

/// Builds [`TesseractEngine`]s after checking the model files exist.
#[derive(Debug, Clone)]
pub struct TesseractFactory {
    program: String,
    page_segmentation_mode: Option<u8>,
}

impl TesseractFactory {
    /// Factory from the `[recognition]` settings.
    pub fn new(settings: &RecognitionSettings) -> Self {
        Self {
            program: settings.program.clone(),
            page_segmentation_mode: settings.page_segmentation_mode,
        }
    }
}

impl EngineFactory for TesseractFactory {
    fn create(&self, data_path: &Path, language: &str) -> AppResult<Box<dyn RecognitionEngine>> {
        let init_error = |message: String| OcrError::EngineInit {
            language: language.to_string(),
            message,
        };

        if !data_path.is_dir() {
            return Err(init_error(format!(
                "model directory {} does not exist",
                data_path.display()
            )));
        }
        for lang in language.split('+').filter(|l| !l.is_empty()) {
            let model = data_path.join(format!("{lang}.traineddata"));
            if !model.is_file() {
                return Err(init_error(format!("missing model {}", model.display())));
            }
        }

        debug!(language, data_path = %data_path.display(), "tesseract engine ready");
        Ok(Box::new(TesseractEngine {
            program: self.program.clone(),
            data_path: data_path.to_path_buf(),
            language: language.to_string(),
            page_segmentation_mode: self.page_segmentation_mode,
        }))
    }
}

/// Engine invoking the `tesseract` CLI once per image.
#[derive(Debug)]
pub struct TesseractEngine {
    program: String,
    data_path: PathBuf,
    language: String,
    page_segmentation_mode: Option<u8>,
}

impl TesseractEngine {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("stdin")
            .arg("stdout")
            .arg("--tessdata-dir")
            .arg(&self.data_path)
            .arg("-l")
            .arg(&self.language)
            .arg("-c")
            .arg("page_separator=");
        if let Some(psm) = self.page_segmentation_mode {
            cmd.arg("--psm").arg(psm.to_string());
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl RecognitionEngine for TesseractEngine {
    fn recognize(&mut self, image: &Frame) -> AppResult<String> {
        if image.is_empty() {
            return Err(OcrError::Recognition("empty image".into()));
        }

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| OcrError::Recognition(format!("failed to spawn {}: {e}", self.program)))?;

        // Feed stdin from a helper thread so a large image cannot deadlock against a
        // full stdout pipe.
        let pnm = image.to_pnm();
        let feeder = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || stdin.write_all(&pnm))
        });

        let output = child
            .wait_with_output()
            .map_err(|e| OcrError::Recognition(format!("{} did not finish: {e}", self.program)))?;

        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(OcrError::Recognition(format!("failed to send image: {e}")))
                }
                Err(_) => return Err(OcrError::Recognition("image feeder panicked".into())),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Recognition(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| OcrError::Recognition(format!("output is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn factory() -> TesseractFactory {
        TesseractFactory::new(&RecognitionSettings {
            program: "tesseract".into(),
            page_segmentation_mode: Some(7),
        })
    }

    #[test]
    fn create_requires_every_language_model() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("eng.traineddata"), b"model").unwrap();

        assert!(factory().create(dir.path(), "eng").is_ok());

        let err = factory().create(dir.path(), "eng+chi_sim").err().unwrap();
        assert!(matches!(err, OcrError::EngineInit { .. }));
        assert!(err.to_string().contains("chi_sim.traineddata"));
    }

    #[test]
    fn create_fails_without_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("tessdata");
        assert!(factory().create(&missing, "eng").is_err());
    }

    #[test]
    fn command_passes_language_and_psm() {
        let engine = TesseractEngine {
            program: "tesseract".into(),
            data_path: PathBuf::from("/srv/tessdata"),
            language: "eng+chi_sim".into(),
            page_segmentation_mode: Some(7),
        };
        let args: Vec<String> = engine
            .command()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(&args[..2], ["stdin", "stdout"]);
        assert!(args.windows(2).any(|w| w == ["-l", "eng+chi_sim"]));
        assert!(args.windows(2).any(|w| w == ["--psm", "7"]));
    }

    #[test]
    fn missing_program_is_a_recognition_error() {
        let mut engine = TesseractEngine {
            program: "stream-ocr-no-such-tesseract".into(),
            data_path: PathBuf::from("/nonexistent"),
            language: "eng".into(),
            page_segmentation_mode: None,
        };
        let err = engine.recognize(&Frame::filled(4, 4, 255)).unwrap_err();
        assert!(err.is_recoverable());
    }
}
