//! Per-request composition: validate input, consult the cache, recognize
//! (inline or through the job dispatcher), extract identifiers.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::cache::{CacheStats, ResultCache};
use crate::config::Settings;
use crate::error::OcrError;
use crate::evaluator::VariantEvaluator;
use crate::fingerprint::Fingerprint;
use crate::identifiers::{self, IdentifierRegistry, PrimaryTypePolicy};
use crate::jobs::{
    ChannelQueue, InFlight, InputKind, JobDispatcher, JobId, JobInput, JobOutcome, JobRunner, JobSnapshot,
    JobStatus,
};
use crate::ocr::{BackendKind, BackendPool, DefaultBackendFactory};
use crate::pdf::{EmbeddedImageRasterizer, PageRasterizer};
use crate::schema::{
    HealthResponse, IdentifiersResponse, JobAccepted, JobResultResponse, RecognitionResponse, RecognitionResult,
};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff", "webp"];
const MAX_LANGUAGE_LEN: usize = 64;

/// An uploaded file plus the caller's recognition choices.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub backend: Option<String>,
    pub language: Option<String>,
}

/// One unit of recognition work, shared by sync requests and job workers.
pub struct RecognitionPipeline {
    slots: Arc<Semaphore>,
    backends: BackendPool,
    evaluator: VariantEvaluator,
    rasterizer: Arc<dyn PageRasterizer>,
    pdf_max_pages: usize,
}

impl RecognitionPipeline {
    pub fn new(
        slots: usize,
        backends: BackendPool,
        evaluator: VariantEvaluator,
        rasterizer: Arc<dyn PageRasterizer>,
        pdf_max_pages: usize,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
            backends,
            evaluator,
            rasterizer,
            pdf_max_pages,
        }
    }

    /// Recognize `input` once slot and backend are available.
    pub async fn recognize(&self, input: &JobInput) -> Result<RecognitionResult, OcrError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| OcrError::ServiceUnavailable("recognition slots closed".into()))?;

        let backend = self.backends.get(input.backend, &input.language).await?;
        let started = Instant::now();

        let result = match input.kind {
            InputKind::Image => self.evaluator.evaluate(&input.bytes, backend.as_ref()).await?,
            InputKind::Pdf => {
                let bytes = input.bytes.clone();
                let rasterizer = self.rasterizer.clone();
                let max_pages = self.pdf_max_pages;
                let images =
                    tokio::task::spawn_blocking(move || rasterizer.rasterize(&bytes, max_pages))
                        .await
                        .map_err(|e| {
                            OcrError::ServiceUnavailable(format!("rasterizer task failed: {}", e))
                        })?
                        .map_err(|e| OcrError::InvalidImage(e.to_string()))?;

                debug!("{}: rasterized {} page(s)", input.filename, images.len());
                let mut pages = Vec::with_capacity(images.len());
                for image in images {
                    pages.push(
                        self.evaluator
                            .evaluate_page(image.page, &image.bytes, backend.as_ref())
                            .await?,
                    );
                }
                RecognitionResult::from_pages(input.backend, pages, started.elapsed())
            }
        };

        info!(
            "Recognized {} with {} in {}ms ({} chars, confidence {:.3}, winner {})",
            input.filename,
            input.backend,
            result.elapsed_ms,
            result.joined_text.chars().count(),
            result.confidence,
            result
                .backend_variant()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(result)
    }
}

#[async_trait::async_trait]
impl JobRunner for RecognitionPipeline {
    async fn run(&self, input: &JobInput) -> Result<RecognitionResult, OcrError> {
        self.recognize(input).await
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_backend: BackendKind,
    pub default_language: String,
    pub max_file_size: usize,
    pub primary_policy: PrimaryTypePolicy,
}

/// What `job_result` reports.
#[derive(Debug, Clone)]
pub enum JobResultReply {
    Ready(JobResultResponse),
    NotReady(JobSnapshot),
}

/// The service object behind the query surface.
pub struct Orchestrator {
    config: OrchestratorConfig,
    cache: ResultCache,
    pipeline: Arc<RecognitionPipeline>,
    dispatcher: JobDispatcher,
    identifiers: IdentifierRegistry,
    /// Recognitions in progress, shared with the job workers.
    in_flight: Arc<InFlight>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        cache: ResultCache,
        pipeline: Arc<RecognitionPipeline>,
        dispatcher: JobDispatcher,
        in_flight: Arc<InFlight>,
        identifiers: IdentifierRegistry,
    ) -> Self {
        Self {
            config,
            cache,
            pipeline,
            dispatcher,
            identifiers,
            in_flight,
        }
    }

    /// Wire the full service from settings. Spawns the worker pool.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut grammars = identifiers::builtin_grammars();
        if let Some(path) = &settings.identifier_patterns {
            let extra = identifiers::load_grammars(path)?;
            info!("Loaded {} extra identifier grammars from {:?}", extra.len(), path);
            grammars.extend(extra);
        }
        let registry = IdentifierRegistry::compile(&grammars);
        info!("Identifier grammars: {:?}", registry.document_types());

        let cache = ResultCache::new(settings.cache_ttl, settings.cache_max_size);
        let factory = DefaultBackendFactory::new(
            settings.tesseract_bin.clone(),
            settings.sidecar_url.clone(),
        );
        let pipeline = Arc::new(RecognitionPipeline::new(
            settings.workers,
            BackendPool::new(Arc::new(factory)),
            VariantEvaluator::new(settings.min_text_len, &settings.psm_modes),
            Arc::new(EmbeddedImageRasterizer),
            settings.pdf_max_pages,
        ));
        let in_flight = Arc::new(InFlight::new(cache.clone()));
        let dispatcher = JobDispatcher::start(
            settings.dispatcher(),
            Arc::new(ChannelQueue::new(settings.queue_max_size)),
            pipeline.clone(),
            in_flight.clone(),
            cache.clone(),
        );

        Ok(Self::new(
            OrchestratorConfig {
                default_backend: settings.default_backend,
                default_language: settings.default_language.clone(),
                max_file_size: settings.max_file_size,
                primary_policy: settings.primary_policy,
            },
            cache,
            pipeline,
            dispatcher,
            in_flight,
            registry,
        ))
    }

    /// Validate a request and resolve it into a recognition input.
    pub fn prepare(&self, request: RecognitionRequest) -> Result<JobInput, OcrError> {
        let extension = Path::new(&request.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let kind = if extension == "pdf" {
            InputKind::Pdf
        } else if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            InputKind::Image
        } else {
            return Err(OcrError::UnsupportedFileType(if extension.is_empty() {
                request.filename
            } else {
                format!(".{}", extension)
            }));
        };

        if request.bytes.is_empty() {
            return Err(OcrError::EmptyInput);
        }
        if request.bytes.len() > self.config.max_file_size {
            return Err(OcrError::TooLarge {
                size: request.bytes.len(),
                max: self.config.max_file_size,
            });
        }

        let backend = match request.backend.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                BackendKind::from_str(name).ok_or_else(|| OcrError::UnknownBackend(name.to_string()))?
            }
            _ => self.config.default_backend,
        };
        let language = request
            .language
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.config.default_language.clone());
        if !is_language_code(&language) {
            return Err(OcrError::UnsupportedLanguage(language));
        }

        let fingerprint = Fingerprint::of_content(&request.bytes);
        Ok(JobInput {
            filename: request.filename,
            bytes: Arc::from(request.bytes),
            kind,
            backend,
            key: fingerprint.with_profile(backend, &language),
            language,
            fingerprint,
        })
    }

    /// Recognize inline. Concurrent calls for the same key share one recognition.
    pub async fn recognize_sync(
        &self,
        request: RecognitionRequest,
    ) -> Result<RecognitionResponse, OcrError> {
        let input = self.prepare(request)?;

        if let Some(result) = self.cache.lookup(&input.key) {
            debug!("Cache hit for {} ({})", input.filename, input.fingerprint);
            return Ok(self.respond(&input, result, true));
        }

        let result = self
            .in_flight
            .run(input.key, self.pipeline.recognize(&input), |result| {
                self.cache.insert(input.key, result.clone())
            })
            .await?;

        Ok(self.respond(&input, result, false))
    }

    fn respond(
        &self,
        input: &JobInput,
        result: Arc<RecognitionResult>,
        cache_hit: bool,
    ) -> RecognitionResponse {
        let ids = self.extract_identifiers(&result.joined_text);
        RecognitionResponse {
            filename: input.filename.clone(),
            fingerprint: input.fingerprint,
            cache_hit,
            language: input.language.clone(),
            result,
            document_ids: ids.document_ids,
            document_type: ids.document_type,
        }
    }

    /// Queue recognition and return the job handle.
    pub fn submit(&self, request: RecognitionRequest) -> Result<JobAccepted, OcrError> {
        let input = self.prepare(request)?;
        let snapshot = self.dispatcher.submit(input)?;
        Ok(JobAccepted {
            job_id: snapshot.job_id,
            status: snapshot.status,
            fingerprint: snapshot.fingerprint,
        })
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobSnapshot, OcrError> {
        self.dispatcher.status(job_id)
    }

    /// Result of a job. Failed and cancelled jobs come back as their error.
    pub fn job_result(&self, job_id: JobId) -> Result<JobResultReply, OcrError> {
        match self.dispatcher.result(job_id)? {
            JobOutcome::Ready(result) => {
                let ids = self.extract_identifiers(&result.joined_text);
                Ok(JobResultReply::Ready(JobResultResponse {
                    job_id,
                    status: JobStatus::Succeeded,
                    result,
                    document_ids: ids.document_ids,
                    document_type: ids.document_type,
                }))
            }
            JobOutcome::NotReady(snapshot) => Ok(JobResultReply::NotReady(snapshot)),
            JobOutcome::Failed(e) => Err(e),
        }
    }

    pub fn cancel_job(&self, job_id: JobId) -> Result<JobSnapshot, OcrError> {
        self.dispatcher.cancel(job_id)
    }

    /// Identifiers in `text` and the primary type under the configured policy.
    pub fn extract_identifiers(&self, text: &str) -> IdentifiersResponse {
        let document_ids = self.identifiers.extract(text);
        let document_type = document_ids
            .primary(self.config.primary_policy)
            .map(str::to_string);
        IdentifiersResponse {
            document_ids,
            document_type,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok",
            backends_ready: self.pipeline.backends.initialized(),
            jobs: self.dispatcher.job_count(),
            cache_entries: self.cache.len(),
        }
    }

    /// Sweep expired cache entries and purge old finished jobs.
    pub fn run_maintenance(&self) -> (usize, usize) {
        let evicted = self.cache.evict_expired();
        let purged = self.dispatcher.purge_finished();
        if evicted > 0 || purged > 0 {
            info!(
                "Maintenance: evicted {} cache entries, purged {} jobs",
                evicted, purged
            );
        }
        (evicted, purged)
    }

    /// Periodically run maintenance until the returned task is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.run_maintenance();
            }
        })
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

/// Language codes such as `eng`, `chi_sim` or `eng+hin`.
fn is_language_code(language: &str) -> bool {
    language.len() <= MAX_LANGUAGE_LEN
        && language.split('+').all(|code| {
            !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::jobs::DispatcherConfig;
    use crate::ocr::{
        BackendError, BackendFactory, RecognitionBackend, RecognitionFragment, SegmentationMode,
    };
    use crate::pdf::{PageImage, PdfError};
    use image::{GrayImage, Luma};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads the same card text for every call.
    struct CardBackend {
        kind: BackendKind,
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RecognitionBackend for CardBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn recognize(
            &self,
            _image: &[u8],
            _mode: SegmentationMode,
        ) -> Result<Vec<RecognitionFragment>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(vec![
                RecognitionFragment::new("INCOME TAX DEPARTMENT", 0.91, RecognitionFragment::rect(0.0, 0.0, 200.0, 20.0)),
                RecognitionFragment::new("ABCDE1234F", 0.88, RecognitionFragment::rect(0.0, 30.0, 120.0, 20.0)),
            ])
        }
    }

    struct CardFactory {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl BackendFactory for CardFactory {
        async fn create(
            &self,
            kind: BackendKind,
            language: &str,
        ) -> Result<Arc<dyn RecognitionBackend>, BackendError> {
            if language == "zzz" {
                return Err(BackendError::UnsupportedLanguage(language.to_string()));
            }
            Ok(Arc::new(CardBackend {
                kind,
                calls: self.calls.clone(),
                delay: self.delay,
            }))
        }
    }

    /// Returns the same page image for each of `pages` pages.
    struct RepeatRasterizer {
        pages: u32,
    }

    impl PageRasterizer for RepeatRasterizer {
        fn rasterize(&self, _pdf: &[u8], max_pages: usize) -> Result<Vec<PageImage>, PdfError> {
            Ok((1..=self.pages)
                .take(max_pages)
                .map(|page| PageImage {
                    page,
                    bytes: card_png(),
                })
                .collect())
        }
    }

    fn card_png() -> Vec<u8> {
        let img = GrayImage::from_fn(40, 20, |x, y| Luma([if (x + y) % 7 < 3 { 15 } else { 235 }]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn orchestrator(delay: Duration) -> (Orchestrator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = CardFactory {
            calls: calls.clone(),
            delay,
        };
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        let pipeline = Arc::new(RecognitionPipeline::new(
            2,
            BackendPool::new(Arc::new(factory)),
            VariantEvaluator::new(5, &[6]),
            Arc::new(RepeatRasterizer { pages: 2 }),
            3,
        ));
        let in_flight = Arc::new(InFlight::new(cache.clone()));
        let dispatcher = JobDispatcher::start(
            DispatcherConfig {
                workers: 2,
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            Arc::new(ChannelQueue::new(16)),
            pipeline.clone(),
            in_flight.clone(),
            cache.clone(),
        );
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                default_backend: BackendKind::Tesseract,
                default_language: "eng".to_string(),
                max_file_size: 1024 * 1024,
                primary_policy: PrimaryTypePolicy::FirstDeclared,
            },
            cache,
            pipeline,
            dispatcher,
            in_flight,
            IdentifierRegistry::builtin(),
        );
        (orchestrator, calls)
    }

    fn request(filename: &str, bytes: Vec<u8>) -> RecognitionRequest {
        RecognitionRequest {
            filename: filename.to_string(),
            bytes,
            backend: None,
            language: None,
        }
    }

    #[tokio::test]
    async fn test_second_identical_request_is_cache_hit() {
        let (orchestrator, calls) = orchestrator(Duration::ZERO);

        let first = orchestrator
            .recognize_sync(request("pan.png", card_png()))
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.result.joined_text, "INCOME TAX DEPARTMENT ABCDE1234F");
        assert_eq!(first.document_type.as_deref(), Some("PAN"));
        let calls_after_first = calls.load(Ordering::SeqCst);
        // Five grayscale variants with one segmentation mode
        assert_eq!(calls_after_first, 5);

        let second = orchestrator
            .recognize_sync(request("copy-of-pan.png", card_png()))
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.result.joined_text, first.result.joined_text);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);

        let stats = orchestrator.cache_stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_backend_choice_is_part_of_the_key() {
        let (orchestrator, calls) = orchestrator(Duration::ZERO);

        orchestrator
            .recognize_sync(request("card.jpg", card_png()))
            .await
            .unwrap();
        let mut sidecar = request("card.jpg", card_png());
        sidecar.backend = Some("paddle".to_string());
        let response = orchestrator.recognize_sync(sidecar).await.unwrap();

        assert!(!response.cache_hit);
        assert_eq!(response.result.backend, BackendKind::Sidecar);
        // Sidecar plan is a single pass over the original image
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_concurrent_sync_requests_share_recognition() {
        let (orchestrator, calls) = orchestrator(Duration::from_millis(20));

        let (a, b) = tokio::join!(
            orchestrator.recognize_sync(request("a.png", card_png())),
            orchestrator.recognize_sync(request("b.png", card_png())),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(!a.cache_hit && !b.cache_hit);
        assert_eq!(a.result.joined_text, b.result.joined_text);
    }

    #[tokio::test]
    async fn test_client_input_errors() {
        let (orchestrator, calls) = orchestrator(Duration::ZERO);

        let err = orchestrator.prepare(request("notes.txt", b"hello".to_vec())).unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedFileType(ref ext) if ext == ".txt"));

        let err = orchestrator.prepare(request("README", b"hello".to_vec())).unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedFileType(_)));

        let err = orchestrator.prepare(request("scan.PNG", Vec::new())).unwrap_err();
        assert!(matches!(err, OcrError::EmptyInput));

        let err = orchestrator
            .prepare(request("huge.tiff", vec![0u8; 2 * 1024 * 1024]))
            .unwrap_err();
        assert!(matches!(err, OcrError::TooLarge { .. }));

        let mut unknown = request("scan.png", card_png());
        unknown.backend = Some("magic".to_string());
        let err = orchestrator.recognize_sync(unknown).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientInput);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_language_defaults_and_overrides() {
        let (orchestrator, _) = orchestrator(Duration::ZERO);

        let default = orchestrator.prepare(request("a.png", card_png())).unwrap();
        assert_eq!(default.language, "eng");

        let mut hindi = request("a.png", card_png());
        hindi.language = Some("hin".to_string());
        let hindi = orchestrator.prepare(hindi).unwrap();
        assert_eq!(hindi.language, "hin");
        assert_eq!(hindi.fingerprint, default.fingerprint);
        assert_ne!(hindi.key, default.key);
    }

    #[tokio::test]
    async fn test_pdf_pages_are_recognized_in_order() {
        let (orchestrator, calls) = orchestrator(Duration::ZERO);

        let response = orchestrator
            .recognize_sync(request("statement.pdf", b"%PDF-1.5 stub".to_vec()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(response.result.pages.len(), 2);
        let pages: Vec<u32> = response.result.fragments.iter().map(|f| f.page).collect();
        assert_eq!(pages, vec![1, 1, 2, 2]);
        assert_eq!(
            response.document_ids.get("PAN").map(|v| v.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_async_job_round_trip() {
        let (orchestrator, _) = orchestrator(Duration::ZERO);

        let accepted = orchestrator.submit(request("pan.webp", card_png())).unwrap();
        assert_eq!(accepted.status, JobStatus::Pending);

        let mut reply = None;
        for _ in 0..200 {
            match orchestrator.job_result(accepted.job_id).unwrap() {
                JobResultReply::Ready(response) => {
                    reply = Some(response);
                    break;
                }
                JobResultReply::NotReady(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        let response = reply.expect("job did not finish");
        assert_eq!(response.document_type.as_deref(), Some("PAN"));

        // The job populated the cache for sync callers
        let sync = orchestrator
            .recognize_sync(request("pan.webp", card_png()))
            .await
            .unwrap();
        assert!(sync.cache_hit);

        // And a resubmit short-circuits
        let again = orchestrator.submit(request("pan.webp", card_png())).unwrap();
        assert_eq!(again.status, JobStatus::Succeeded);

        orchestrator.shutdown().await;
    }

    async fn wait_job(
        orchestrator: &Orchestrator,
        job_id: JobId,
        done: impl Fn(&JobSnapshot) -> bool,
    ) -> JobSnapshot {
        for _ in 0..400 {
            let snapshot = orchestrator.job_status(job_id).unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached the expected state");
    }

    #[tokio::test]
    async fn test_sync_request_joins_running_job() {
        let (orchestrator, calls) = orchestrator(Duration::from_millis(40));

        let accepted = orchestrator.submit(request("pan.png", card_png())).unwrap();
        wait_job(&orchestrator, accepted.job_id, |s| s.status == JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sync = orchestrator
            .recognize_sync(request("pan.png", card_png()))
            .await
            .unwrap();
        assert!(!sync.cache_hit);
        assert_eq!(sync.document_type.as_deref(), Some("PAN"));

        let done = wait_job(&orchestrator, accepted.job_id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_job_joins_running_sync_request() {
        let (orchestrator, calls) = orchestrator(Duration::from_millis(40));

        let job = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let accepted = orchestrator.submit(request("pan.png", card_png())).unwrap();
            assert_eq!(accepted.status, JobStatus::Pending);
            wait_job(&orchestrator, accepted.job_id, |s| s.status.is_terminal()).await
        };
        let (sync, done) = tokio::join!(
            orchestrator.recognize_sync(request("pan.png", card_png())),
            job,
        );

        assert!(!sync.unwrap().cache_hit);
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_malformed_language_is_rejected() {
        let (orchestrator, calls) = orchestrator(Duration::ZERO);

        let long = "x".repeat(65);
        for bad in ["../eng", "eng+", "e n g", long.as_str()] {
            let mut req = request("pan.png", card_png());
            req.language = Some(bad.to_string());
            let err = orchestrator.prepare(req).unwrap_err();
            assert!(matches!(err, OcrError::UnsupportedLanguage(_)), "{bad}");
        }

        let mut combined = request("pan.png", card_png());
        combined.language = Some("eng+chi_sim".to_string());
        assert!(orchestrator.prepare(combined).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_language_pack_fails_job_without_retry() {
        let (orchestrator, calls) = orchestrator(Duration::ZERO);

        let mut sync = request("pan.png", card_png());
        sync.language = Some("zzz".to_string());
        let err = orchestrator.recognize_sync(sync).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientInput);

        let mut queued = request("pan.png", card_png());
        queued.language = Some("zzz".to_string());
        let accepted = orchestrator.submit(queued).unwrap();
        let done = wait_job(&orchestrator, accepted.job_id, |s| s.status.is_terminal()).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.error, Some(ErrorKind::ClientInput));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (orchestrator, _) = orchestrator(Duration::ZERO);
        let err = orchestrator.job_status(JobId::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_extract_identifiers_policy() {
        let (orchestrator, _) = orchestrator(Duration::ZERO);
        let ids = orchestrator.extract_identifiers("no identifiers here");
        assert!(ids.document_ids.is_empty());
        assert!(ids.document_type.is_none());
    }
}
