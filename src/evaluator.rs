//! Best-candidate selection across preprocessing variants and backend modes.
//!
//! Variants form the outer loop and segmentation modes the inner loop. A
//! candidate replaces the running best only when its score is strictly
//! higher and its text is longer than the minimum length, so ties keep the
//! first candidate encountered.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::OcrError;
use crate::ocr::{BackendError, BackendKind, RecognitionBackend, RecognitionFragment, SegmentationMode};
use crate::preprocess::{self, Variant};
use crate::schema::{join_fragments, RecognitionResult};

/// Which (variant, parameter) pair produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VariantLabel {
    pub variant: Variant,
    pub mode: SegmentationMode,
}

impl std::fmt::Display for VariantLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} | {}", self.variant, self.mode)
    }
}

/// Ordered variants crossed with ordered modes.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPlan {
    pub variants: Vec<Variant>,
    pub modes: Vec<SegmentationMode>,
}

impl EvaluationPlan {
    /// Every standard variant under each of the given page segmentation modes.
    pub fn exhaustive(psm_modes: &[u8]) -> Self {
        Self {
            variants: Variant::STANDARD.to_vec(),
            modes: psm_modes.iter().map(|&n| SegmentationMode::Psm(n)).collect(),
        }
    }

    /// One pass over the untouched input.
    pub fn single_pass() -> Self {
        Self {
            variants: vec![Variant::Original],
            modes: vec![SegmentationMode::Auto],
        }
    }

    pub fn attempts(&self) -> usize {
        self.variants.len() * self.modes.len()
    }
}

/// Output of one backend attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub fragments: Vec<RecognitionFragment>,
    pub text: String,
    /// Mean fragment confidence, 0 when nothing was recognized.
    pub score: f64,
}

impl Candidate {
    pub fn from_fragments(fragments: Vec<RecognitionFragment>) -> Self {
        let text = join_fragments(&fragments);
        let score = if fragments.is_empty() {
            0.0
        } else {
            fragments.iter().map(|f| f.confidence).sum::<f64>() / fragments.len() as f64
        };
        Self {
            fragments,
            text,
            score,
        }
    }
}

/// Winner for one page.
#[derive(Debug, Clone)]
pub struct PageRecognition {
    pub page: u32,
    pub fragments: Vec<RecognitionFragment>,
    pub winner: Option<VariantLabel>,
    pub score: f64,
    pub attempts: usize,
    pub failed_attempts: usize,
}

/// Running best candidate.
struct Selection {
    min_text_len: usize,
    best: Option<(VariantLabel, Candidate)>,
    best_score: f64,
    attempts: usize,
    failures: usize,
    last_error: Option<String>,
}

impl Selection {
    fn new(min_text_len: usize) -> Self {
        Self {
            min_text_len,
            best: None,
            best_score: f64::NEG_INFINITY,
            attempts: 0,
            failures: 0,
            last_error: None,
        }
    }

    fn offer(&mut self, label: VariantLabel, outcome: Result<Candidate, BackendError>) {
        self.attempts += 1;
        match outcome {
            Ok(candidate) => {
                let long_enough = candidate.text.chars().count() > self.min_text_len;
                if candidate.score > self.best_score && long_enough {
                    debug!("New best {} (score {:.3})", label, candidate.score);
                    self.best_score = candidate.score;
                    self.best = Some((label, candidate));
                }
            }
            Err(e) => {
                warn!("Skipping failed attempt {}: {}", label, e);
                self.failures += 1;
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn finish(self, page: u32) -> Result<PageRecognition, OcrError> {
        if self.failures == self.attempts {
            return Err(OcrError::BackendUnavailable(format!(
                "all {} recognition attempts failed (last error: {})",
                self.attempts,
                self.last_error.as_deref().unwrap_or("no attempts planned")
            )));
        }

        Ok(match self.best {
            Some((label, candidate)) => PageRecognition {
                page,
                fragments: candidate.fragments,
                winner: Some(label),
                score: candidate.score,
                attempts: self.attempts,
                failed_attempts: self.failures,
            },
            None => PageRecognition {
                page,
                fragments: Vec::new(),
                winner: None,
                score: 0.0,
                attempts: self.attempts,
                failed_attempts: self.failures,
            },
        })
    }
}

/// Drives a backend across an evaluation plan and keeps the best candidate.
pub struct VariantEvaluator {
    plans: HashMap<BackendKind, EvaluationPlan>,
    min_text_len: usize,
}

impl VariantEvaluator {
    pub fn new(min_text_len: usize, tesseract_modes: &[u8]) -> Self {
        let mut plans = HashMap::new();
        plans.insert(BackendKind::Tesseract, EvaluationPlan::exhaustive(tesseract_modes));
        plans.insert(BackendKind::Sidecar, EvaluationPlan::single_pass());
        Self {
            plans,
            min_text_len,
        }
    }

    /// Override the plan used for one backend kind.
    #[cfg(test)]
    pub fn with_plan(mut self, kind: BackendKind, plan: EvaluationPlan) -> Self {
        self.plans.insert(kind, plan);
        self
    }

    pub fn plan(&self, kind: BackendKind) -> EvaluationPlan {
        self.plans
            .get(&kind)
            .cloned()
            .unwrap_or_else(EvaluationPlan::single_pass)
    }

    /// Recognize a single image.
    pub async fn evaluate(
        &self,
        image: &[u8],
        backend: &dyn RecognitionBackend,
    ) -> Result<RecognitionResult, OcrError> {
        let started = Instant::now();
        let page = self.evaluate_page(1, image, backend).await?;
        Ok(RecognitionResult::from_pages(
            backend.kind(),
            vec![page],
            started.elapsed(),
        ))
    }

    /// Run every (variant, mode) pair of the backend's plan over one page image.
    pub async fn evaluate_page(
        &self,
        page: u32,
        image: &[u8],
        backend: &dyn RecognitionBackend,
    ) -> Result<PageRecognition, OcrError> {
        let plan = self.plan(backend.kind());
        debug!(
            "Page {}: evaluating {} with {} attempt(s)",
            page,
            backend.kind(),
            plan.attempts()
        );

        let owned = image.to_vec();
        let variants = plan.variants.clone();
        let rendered = tokio::task::spawn_blocking(move || {
            preprocess::render_variants(&owned, &variants)
        })
        .await
        .map_err(|e| OcrError::ServiceUnavailable(format!("preprocessing task failed: {}", e)))?
        .map_err(|e| OcrError::InvalidImage(e.to_string()))?;

        let mut selection = Selection::new(self.min_text_len);
        for (variant, bytes) in &rendered {
            for &mode in &plan.modes {
                let label = VariantLabel {
                    variant: *variant,
                    mode,
                };
                let outcome = backend
                    .recognize(bytes, mode)
                    .await
                    .map(Candidate::from_fragments);
                selection.offer(label, outcome);
            }
        }

        let result = selection.finish(page)?;
        debug!(
            "Page {}: winner={} score={:.3} ({} attempts, {} failed)",
            page,
            result
                .winner
                .map(|w| w.to_string())
                .unwrap_or_else(|| "none".to_string()),
            result.score,
            result.attempts,
            result.failed_attempts
        );
        Ok(result)
    }
}
