//! Recognition backend abstraction.
//!
//! Defines the [`RecognitionBackend`] trait and unified types so different
//! engines (Tesseract CLI, HTTP sidecar, ...) can be swapped via query parameter.

pub mod pool;
pub mod sidecar;
pub mod tesseract;

use serde::Serialize;
use thiserror::Error;

pub use pool::{BackendFactory, BackendPool, DefaultBackendFactory};

/// A single piece of recognized text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionFragment {
    pub text: String,
    /// Normalized to `0.0..=1.0`.
    pub confidence: f64,
    /// Polygon around the text, clockwise from top-left.
    pub region: Vec<[f32; 2]>,
    /// 1-indexed page the fragment came from.
    pub page: u32,
}

impl RecognitionFragment {
    pub fn new(text: impl Into<String>, confidence: f64, region: Vec<[f32; 2]>) -> Self {
        Self {
            text: text.into(),
            confidence,
            region,
            page: 1,
        }
    }

    /// Region for an axis-aligned box.
    pub fn rect(left: f32, top: f32, width: f32, height: f32) -> Vec<[f32; 2]> {
        vec![
            [left, top],
            [left + width, top],
            [left + width, top + height],
            [left, top + height],
        ]
    }
}

/// Backend configuration parameter varied by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// Let the backend decide.
    Auto,
    /// Tesseract page segmentation mode.
    Psm(u8),
}

impl std::fmt::Display for SegmentationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentationMode::Auto => f.write_str("auto"),
            SegmentationMode::Psm(n) => write!(f, "psm={}", n),
        }
    }
}

/// Errors from a single backend invocation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend not available: {0}")]
    NotAvailable(String),

    /// The engine runs but has no model for the requested language.
    #[error("Language not installed: {0}")]
    UnsupportedLanguage(String),

    #[error("Recognition failed: {0}")]
    Failed(String),

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Async trait implemented by each recognition engine.
///
/// Implementations must return an empty list, not an error, for blank input.
#[async_trait::async_trait]
pub trait RecognitionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    async fn recognize(
        &self,
        image: &[u8],
        mode: SegmentationMode,
    ) -> Result<Vec<RecognitionFragment>, BackendError>;
}

/// Known backend identifiers used for registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Tesseract,
    Sidecar,
}

impl BackendKind {
    /// Parse a query-parameter string into a backend kind.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tesseract" => Some(Self::Tesseract),
            "sidecar" | "paddle" | "paddleocr" | "easyocr" => Some(Self::Sidecar),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tesseract => "tesseract",
            Self::Sidecar => "sidecar",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
