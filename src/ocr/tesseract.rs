//! Tesseract backend.
//!
//! Runs the `tesseract` binary with the image on stdin and parses its TSV
//! output into word-level fragments.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BackendError, BackendKind, RecognitionBackend, RecognitionFragment, SegmentationMode};

/// TSV row level for individual words.
const TSV_WORD_LEVEL: u32 = 5;
const TSV_MIN_FIELDS: usize = 12;

pub struct TesseractBackend {
    binary: String,
    language: String,
}

impl TesseractBackend {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }

    /// Verify the binary runs and every requested language pack is installed.
    pub async fn probe(
        binary: impl Into<String>,
        language: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let backend = Self::new(binary, language);

        let output = Command::new(&backend.binary)
            .arg("--list-langs")
            .output()
            .await
            .map_err(|e| backend.spawn_error(e))?;

        if !output.status.success() {
            return Err(BackendError::NotAvailable(format!(
                "{} --list-langs exited with {}",
                backend.binary, output.status
            )));
        }

        let listed = String::from_utf8_lossy(&output.stdout);
        let installed: Vec<&str> = listed.lines().skip(1).map(str::trim).collect();
        for lang in backend.language.split('+') {
            if !installed.contains(&lang) {
                return Err(BackendError::UnsupportedLanguage(lang.to_string()));
            }
        }

        info!(
            "Tesseract backend ready (binary={}, language={})",
            backend.binary, backend.language
        );
        Ok(backend)
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackendError::NotAvailable(format!(
                "{} not found (install tesseract-ocr)",
                self.binary
            ))
        } else {
            BackendError::Io(e)
        }
    }
}

#[async_trait::async_trait]
impl RecognitionBackend for TesseractBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tesseract
    }

    async fn recognize(
        &self,
        image: &[u8],
        mode: SegmentationMode,
    ) -> Result<Vec<RecognitionFragment>, BackendError> {
        let mut command = Command::new(&self.binary);
        command
            .args(["stdin", "stdout", "-l", self.language.as_str(), "--oem", "3"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let SegmentationMode::Psm(psm) = mode {
            command.arg("--psm").arg(psm.to_string());
        }
        command.arg("tsv");

        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(image).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Failed(format!(
                "tesseract ({}) failed: {}",
                mode,
                stderr.trim()
            )));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let fragments = parse_tsv(&tsv);
        debug!("tesseract {}: {} words", mode, fragments.len());
        Ok(fragments)
    }
}

/// Extract word rows from Tesseract TSV output.
///
/// Rows other than words, rows with negative confidence and empty words are
/// dropped. Confidence is rescaled from 0-100 to 0-1.
pub fn parse_tsv(tsv: &str) -> Vec<RecognitionFragment> {
    let mut fragments = Vec::new();

    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < TSV_MIN_FIELDS {
            continue;
        }

        if fields[0].trim().parse::<u32>().ok() != Some(TSV_WORD_LEVEL) {
            continue;
        }

        let conf = fields[10].trim().parse::<f64>().unwrap_or(-1.0);
        if conf < 0.0 {
            continue;
        }

        let text = fields[11].trim();
        if text.is_empty() {
            continue;
        }

        let coord = |i: usize| fields[i].trim().parse::<f32>().unwrap_or(0.0);
        fragments.push(RecognitionFragment::new(
            text,
            (conf / 100.0).clamp(0.0, 1.0),
            RecognitionFragment::rect(coord(6), coord(7), coord(8), coord(9)),
        ));
    }

    fragments
}
