//! Error taxonomy shared by the cache, evaluator, dispatcher and query surface.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::jobs::JobId;
use crate::ocr::BackendError;

/// Stable condition tag carried in error bodies and job snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClientInput,
    BackendUnavailable,
    Timeout,
    ServiceUnavailable,
    NotFound,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientInput => "client_input",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the orchestration core.
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Uploaded file is empty")]
    EmptyInput,

    #[error("File too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Job timed out after {:.1}s", elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job was cancelled: {0}")]
    Cancelled(JobId),
}

impl OcrError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::UnsupportedFileType(_)
            | OcrError::EmptyInput
            | OcrError::TooLarge { .. }
            | OcrError::InvalidImage(_)
            | OcrError::UnknownBackend(_)
            | OcrError::UnsupportedLanguage(_) => ErrorKind::ClientInput,
            OcrError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            OcrError::Timeout { .. } => ErrorKind::Timeout,
            OcrError::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            OcrError::JobNotFound(_) => ErrorKind::NotFound,
            OcrError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Only exhaustion of every backend attempt is worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::BackendUnavailable(_))
    }
}

impl From<BackendError> for OcrError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::UnsupportedLanguage(lang) => OcrError::UnsupportedLanguage(lang),
            other => OcrError::BackendUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(OcrError::EmptyInput.kind(), ErrorKind::ClientInput);
        assert_eq!(
            OcrError::UnsupportedFileType(".gif".into()).kind(),
            ErrorKind::ClientInput
        );
        assert_eq!(
            OcrError::Timeout { elapsed: Duration::from_secs(3) }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ErrorKind::BackendUnavailable.as_str(), "backend_unavailable");
    }

    #[test]
    fn test_only_backend_unavailable_retries() {
        assert!(OcrError::BackendUnavailable("down".into()).is_retryable());
        assert!(!OcrError::EmptyInput.is_retryable());
        assert!(!OcrError::Timeout { elapsed: Duration::from_secs(1) }.is_retryable());
        assert!(!OcrError::ServiceUnavailable("queue".into()).is_retryable());
    }

    #[test]
    fn test_missing_language_is_client_input() {
        let e: OcrError = BackendError::UnsupportedLanguage("xyz".into()).into();
        assert!(matches!(&e, OcrError::UnsupportedLanguage(lang) if lang == "xyz"));
        assert_eq!(e.kind(), ErrorKind::ClientInput);
        assert!(!e.is_retryable());

        let e: OcrError = BackendError::NotAvailable("tesseract missing".into()).into();
        assert_eq!(e.kind(), ErrorKind::BackendUnavailable);
    }

    #[test]
    fn test_timeout_message_reports_elapsed() {
        let e = OcrError::Timeout { elapsed: Duration::from_millis(2500) };
        assert_eq!(e.to_string(), "Job timed out after 2.5s");
    }
}
