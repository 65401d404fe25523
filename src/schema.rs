//! Recognition result and query-surface response types.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::ErrorKind;
use crate::evaluator::{PageRecognition, VariantLabel};
use crate::fingerprint::Fingerprint;
use crate::identifiers::IdentifierMatches;
use crate::jobs::{JobId, JobStatus};
use crate::ocr::{BackendKind, RecognitionFragment};

/// Generate ISO8601 timestamp for current time.
pub fn now_iso8601() -> String {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    iso8601_from_secs(duration.as_secs())
}

fn iso8601_from_secs(secs: u64) -> String {
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let mut year = 1970i32;
    let mut remaining_days = days_since_epoch as i32;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let days_in_months: [i32; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days in days_in_months {
        if remaining_days < days {
            break;
        }
        remaining_days -= days;
        month += 1;
    }
    let day = remaining_days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// Winner summary for one recognized page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub page: u32,
    /// `None` when no candidate passed the minimum text length.
    pub variant: Option<VariantLabel>,
    pub confidence: f64,
    pub attempts: usize,
    pub failed_attempts: usize,
}

/// Final recognition output for one input. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResult {
    pub backend: BackendKind,
    pub fragments: Vec<RecognitionFragment>,
    /// Fragment texts joined with single spaces, in fragment order.
    pub joined_text: String,
    /// Mean winning score across pages that produced text.
    pub confidence: f64,
    pub pages: Vec<PageSummary>,
    pub elapsed_ms: u64,
}

impl RecognitionResult {
    /// Merge per-page winners into one result, in page order.
    pub fn from_pages(backend: BackendKind, pages: Vec<PageRecognition>, elapsed: Duration) -> Self {
        let mut fragments = Vec::new();
        let mut summaries = Vec::with_capacity(pages.len());
        let mut scored = Vec::new();

        for page in pages {
            if page.winner.is_some() {
                scored.push(page.score);
            }
            summaries.push(PageSummary {
                page: page.page,
                variant: page.winner,
                confidence: page.score,
                attempts: page.attempts,
                failed_attempts: page.failed_attempts,
            });
            fragments.extend(page.fragments.into_iter().map(|mut f| {
                f.page = page.page;
                f
            }));
        }

        let joined_text = join_fragments(&fragments);
        let confidence = if scored.is_empty() {
            0.0
        } else {
            scored.iter().sum::<f64>() / scored.len() as f64
        };

        Self {
            backend,
            fragments,
            joined_text,
            confidence,
            pages: summaries,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Winning (variant, parameter) pair of the first page that produced text.
    pub fn backend_variant(&self) -> Option<&VariantLabel> {
        self.pages.iter().find_map(|p| p.variant.as_ref())
    }
}

/// Join fragment texts with single spaces.
pub fn join_fragments(fragments: &[RecognitionFragment]) -> String {
    fragments
        .iter()
        .map(|f| f.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Synchronous recognition response.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResponse {
    pub filename: String,
    pub fingerprint: Fingerprint,
    pub cache_hit: bool,
    pub language: String,
    pub result: Arc<RecognitionResult>,
    pub document_ids: IdentifierMatches,
    pub document_type: Option<String>,
}

/// Returned when an async job is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub status: JobStatus,
    pub fingerprint: Fingerprint,
}

/// Result of a finished async job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResultResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Arc<RecognitionResult>,
    pub document_ids: IdentifierMatches,
    pub document_type: Option<String>,
}

/// Liveness report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backends_ready: usize,
    pub jobs: usize,
    pub cache_entries: usize,
}

/// Identifiers found in a piece of text.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifiersResponse {
    pub document_ids: IdentifierMatches,
    pub document_type: Option<String>,
}

/// Error body for every failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub detail: String,
}
