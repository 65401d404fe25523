//! Job table, worker pool, retry and timeout handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    InFlight, JobId, JobInput, JobOutcome, JobQueue, JobRunner, JobSnapshot, JobStatus, JobTicket,
};
use crate::cache::ResultCache;
use crate::error::OcrError;
use crate::fingerprint::Fingerprint;
use crate::schema::{now_iso8601, RecognitionResult};

const MAX_BACKOFF: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// Total attempts per job, including the first.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Wall-clock limit for a single running attempt.
    pub task_timeout: Duration,
    /// How long terminal jobs stay queryable.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            task_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(86400),
        }
    }
}

impl DispatcherConfig {
    /// Delay before the attempt following failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.retry_backoff
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF)
    }
}

struct JobRecord {
    input: Arc<JobInput>,
    status: JobStatus,
    attempts: u32,
    result: Option<Arc<RecognitionResult>>,
    error: Option<OcrError>,
    created_at: String,
    updated_at: String,
    finished_at: Option<Instant>,
}

impl JobRecord {
    fn new(input: Arc<JobInput>, status: JobStatus) -> Self {
        let now = now_iso8601();
        Self {
            input,
            status,
            attempts: 0,
            result: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
            finished_at: None,
        }
    }

    fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = now_iso8601();
        if status.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
    }

    fn snapshot(&self, job_id: JobId, max_attempts: u32) -> JobSnapshot {
        JobSnapshot {
            job_id,
            status: self.status,
            attempts: self.attempts,
            max_attempts,
            filename: self.input.filename.clone(),
            backend: self.input.backend,
            language: self.input.language.clone(),
            fingerprint: self.input.fingerprint,
            error: self.error.as_ref().map(OcrError::kind),
            detail: self.error.as_ref().map(|e| e.to_string()),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, JobRecord>,
    /// Key → the Pending/Running job recognizing it.
    in_flight: HashMap<Fingerprint, JobId>,
}

impl JobTable {
    fn release(&mut self, key: &Fingerprint, job_id: JobId) {
        if self.in_flight.get(key) == Some(&job_id) {
            self.in_flight.remove(key);
        }
    }
}

struct DispatcherInner {
    table: Mutex<JobTable>,
    queue: Arc<dyn JobQueue>,
    runner: Arc<dyn JobRunner>,
    in_flight: Arc<InFlight>,
    cache: ResultCache,
    config: DispatcherConfig,
}

/// Owns the job table and the worker pool.
pub struct JobDispatcher {
    inner: Arc<DispatcherInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobDispatcher {
    /// Create the dispatcher and spawn `config.workers` worker tasks.
    ///
    /// Attempts run through `in_flight`, so a job whose key is already being
    /// recognized by a synchronous request waits for that result.
    pub fn start(
        config: DispatcherConfig,
        queue: Arc<dyn JobQueue>,
        runner: Arc<dyn JobRunner>,
        in_flight: Arc<InFlight>,
        cache: ResultCache,
    ) -> Self {
        let worker_count = config.workers;
        let inner = Arc::new(DispatcherInner {
            table: Mutex::new(JobTable::default()),
            queue,
            runner,
            in_flight,
            cache,
            config,
        });

        let workers = (0..worker_count)
            .map(|n| {
                let inner = inner.clone();
                tokio::spawn(async move {
                    debug!("Worker {} started", n);
                    while let Some(ticket) = inner.queue.dequeue().await {
                        inner.process(ticket).await;
                    }
                    debug!("Worker {} stopped", n);
                })
            })
            .collect();

        info!("Job dispatcher started with {} workers", worker_count);
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue recognition of `input` and return immediately.
    ///
    /// A key that is already Pending/Running returns the existing job. A key
    /// already cached yields a job that is Succeeded without running.
    pub fn submit(&self, input: JobInput) -> Result<JobSnapshot, OcrError> {
        let inner = &self.inner;
        let max_attempts = inner.config.max_attempts;
        let mut table = inner.lock_table();

        if let Some(&existing) = table.in_flight.get(&input.key) {
            if let Some(record) = table.jobs.get(&existing) {
                if !record.status.is_terminal() {
                    debug!("Joining in-flight job {} for {}", existing, input.key);
                    return Ok(record.snapshot(existing, max_attempts));
                }
            }
        }

        let job_id = JobId::new();
        let input = Arc::new(input);

        if let Some(result) = inner.cache.lookup(&input.key) {
            let mut record = JobRecord::new(input, JobStatus::Succeeded);
            record.result = Some(result);
            record.finished_at = Some(Instant::now());
            let snapshot = record.snapshot(job_id, max_attempts);
            table.jobs.insert(job_id, record);
            info!("Job {} served from cache", job_id);
            return Ok(snapshot);
        }

        inner.queue.enqueue(JobTicket { job_id, attempt: 1 })?;

        let key = input.key;
        let record = JobRecord::new(input, JobStatus::Pending);
        let snapshot = record.snapshot(job_id, max_attempts);
        table.jobs.insert(job_id, record);
        table.in_flight.insert(key, job_id);
        info!("Job {} queued ({})", job_id, snapshot.filename);
        Ok(snapshot)
    }

    pub fn status(&self, job_id: JobId) -> Result<JobSnapshot, OcrError> {
        let table = self.inner.lock_table();
        table
            .jobs
            .get(&job_id)
            .map(|record| record.snapshot(job_id, self.inner.config.max_attempts))
            .ok_or(OcrError::JobNotFound(job_id))
    }

    pub fn result(&self, job_id: JobId) -> Result<JobOutcome, OcrError> {
        let table = self.inner.lock_table();
        let record = table
            .jobs
            .get(&job_id)
            .ok_or(OcrError::JobNotFound(job_id))?;

        let outcome = match (record.status, &record.result) {
            (JobStatus::Succeeded, Some(result)) => JobOutcome::Ready(result.clone()),
            (JobStatus::Cancelled, _) => JobOutcome::Failed(OcrError::Cancelled(job_id)),
            (JobStatus::Failed, _) | (JobStatus::Succeeded, None) => JobOutcome::Failed(
                record
                    .error
                    .clone()
                    .unwrap_or_else(|| OcrError::ServiceUnavailable("job lost its result".into())),
            ),
            (JobStatus::Pending | JobStatus::Running, _) => {
                JobOutcome::NotReady(record.snapshot(job_id, self.inner.config.max_attempts))
            }
        };
        Ok(outcome)
    }

    /// Cancel a Pending or Running job. Running work is not interrupted, but
    /// its result is discarded. Terminal jobs are returned unchanged.
    pub fn cancel(&self, job_id: JobId) -> Result<JobSnapshot, OcrError> {
        let mut table = self.inner.lock_table();
        let record = table
            .jobs
            .get_mut(&job_id)
            .ok_or(OcrError::JobNotFound(job_id))?;

        if !record.status.is_terminal() {
            let previous = record.status;
            record.transition(JobStatus::Cancelled);
            record.error = Some(OcrError::Cancelled(job_id));
            let key = record.input.key;
            info!("Job {} cancelled while {}", job_id, previous);
            table.release(&key, job_id);
        }

        let record = &table.jobs[&job_id];
        Ok(record.snapshot(job_id, self.inner.config.max_attempts))
    }

    /// Drop terminal jobs older than the retention period.
    pub fn purge_finished(&self) -> usize {
        self.purge_finished_at(Instant::now())
    }

    pub fn purge_finished_at(&self, now: Instant) -> usize {
        let retention = self.inner.config.retention;
        let mut table = self.inner.lock_table();
        let before = table.jobs.len();
        table.jobs.retain(|_, record| match record.finished_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        before - table.jobs.len()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock_table().jobs.len()
    }

    /// Close the queue and wait for workers to drain it.
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Job dispatcher stopped");
    }
}

impl DispatcherInner {
    fn lock_table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn process(self: &Arc<Self>, ticket: JobTicket) {
        let job_id = ticket.job_id;
        let input = {
            let mut table = self.lock_table();
            let Some(record) = table.jobs.get_mut(&job_id) else {
                debug!("Dropping ticket for unknown job {}", job_id);
                return;
            };
            if record.status != JobStatus::Pending || record.attempts + 1 != ticket.attempt {
                debug!(
                    "Dropping stale ticket for job {} (attempt {}, status {})",
                    job_id, ticket.attempt, record.status
                );
                return;
            }
            record.attempts = ticket.attempt;
            record.transition(JobStatus::Running);
            record.input.clone()
        };

        info!(
            "Job {} attempt {}/{} started",
            job_id, ticket.attempt, self.config.max_attempts
        );
        let started = Instant::now();
        let attempt = self.in_flight.run(input.key, self.runner.run(&input), |result| {
            self.store_if_current(ticket, result)
        });
        let outcome = match tokio::time::timeout(self.config.task_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OcrError::Timeout {
                elapsed: started.elapsed(),
            }),
        };

        self.finish(ticket, outcome);
    }

    /// Cache a result only while the attempt that produced it still owns
    /// the job. Results of cancelled or superseded attempts are not kept.
    fn store_if_current(&self, ticket: JobTicket, result: &Arc<RecognitionResult>) {
        let table = self.lock_table();
        let Some(record) = table.jobs.get(&ticket.job_id) else {
            return;
        };
        if record.status == JobStatus::Running && record.attempts == ticket.attempt {
            self.cache.insert(record.input.key, result.clone());
        }
    }

    fn finish(
        self: &Arc<Self>,
        ticket: JobTicket,
        outcome: Result<Arc<RecognitionResult>, OcrError>,
    ) {
        let job_id = ticket.job_id;
        let mut table = self.lock_table();
        let Some(record) = table.jobs.get_mut(&job_id) else {
            return;
        };

        if record.status != JobStatus::Running || record.attempts != ticket.attempt {
            debug!(
                "Discarding late result for job {} (now {})",
                job_id, record.status
            );
            return;
        }

        let key = record.input.key;
        match outcome {
            Ok(result) => {
                record.result = Some(result);
                record.error = None;
                record.transition(JobStatus::Succeeded);
                info!("Job {} succeeded on attempt {}", job_id, ticket.attempt);
                table.release(&key, job_id);
            }
            Err(e) if e.is_retryable() && ticket.attempt < self.config.max_attempts => {
                let delay = self.config.backoff(ticket.attempt);
                warn!(
                    "Job {} attempt {} failed: {}; retrying in {:?}",
                    job_id, ticket.attempt, e, delay
                );
                record.error = Some(e);
                record.transition(JobStatus::Pending);
                drop(table);
                self.schedule_retry(
                    JobTicket {
                        job_id,
                        attempt: ticket.attempt + 1,
                    },
                    delay,
                );
            }
            Err(e) => {
                error!(
                    "Job {} failed after {} attempt(s): {}",
                    job_id, ticket.attempt, e
                );
                record.error = Some(e);
                record.transition(JobStatus::Failed);
                table.release(&key, job_id);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, ticket: JobTicket, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner.queue.enqueue(ticket) {
                inner.abandon(ticket.job_id, e.into());
            }
        });
    }

    /// Fail a Pending job whose retry could not be queued.
    fn abandon(&self, job_id: JobId, e: OcrError) {
        let mut table = self.lock_table();
        let Some(record) = table.jobs.get_mut(&job_id) else {
            return;
        };
        if record.status != JobStatus::Pending {
            return;
        }
        error!("Job {} could not be requeued: {}", job_id, e);
        let key = record.input.key;
        record.error = Some(e);
        record.transition(JobStatus::Failed);
        table.release(&key, job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::jobs::{ChannelQueue, InputKind};
    use crate::ocr::BackendKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    type Script = Box<dyn Fn(usize) -> Result<RecognitionResult, OcrError> + Send + Sync>;

    /// Runner whose n-th call (0-based) returns `script(n)`, optionally
    /// waiting on a gate or sleeping first.
    struct ScriptedRunner {
        script: Script,
        calls: AtomicUsize,
        delay: Duration,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedRunner {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                gate: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, _input: &JobInput) -> Result<RecognitionResult, OcrError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.script)(n)
        }
    }

    fn recognized(text: &str) -> RecognitionResult {
        RecognitionResult {
            backend: BackendKind::Tesseract,
            fragments: Vec::new(),
            joined_text: text.to_string(),
            confidence: 0.9,
            pages: Vec::new(),
            elapsed_ms: 1,
        }
    }

    fn input(bytes: &[u8]) -> JobInput {
        let fingerprint = Fingerprint::of_content(bytes);
        JobInput {
            filename: "scan.png".to_string(),
            bytes: Arc::from(bytes),
            kind: InputKind::Image,
            backend: BackendKind::Tesseract,
            language: "eng".to_string(),
            fingerprint,
            key: fingerprint.with_profile(BackendKind::Tesseract, "eng"),
        }
    }

    fn config(workers: usize) -> DispatcherConfig {
        DispatcherConfig {
            workers,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            task_timeout: Duration::from_secs(5),
            retention: Duration::from_secs(60),
        }
    }

    fn start(config: DispatcherConfig, runner: Arc<ScriptedRunner>) -> (JobDispatcher, ResultCache) {
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        let dispatcher = JobDispatcher::start(
            config,
            Arc::new(ChannelQueue::new(16)),
            runner,
            Arc::new(InFlight::new(cache.clone())),
            cache.clone(),
        );
        (dispatcher, cache)
    }

    async fn wait_for(
        dispatcher: &JobDispatcher,
        job_id: JobId,
        done: impl Fn(&JobSnapshot) -> bool,
    ) -> JobSnapshot {
        for _ in 0..500 {
            let snapshot = dispatcher.status(job_id).unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached the expected state");
    }

    async fn wait_terminal(dispatcher: &JobDispatcher, job_id: JobId) -> JobSnapshot {
        wait_for(dispatcher, job_id, |s| s.status.is_terminal()).await
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DispatcherConfig {
            retry_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_success_writes_through_to_cache() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| Ok(recognized("hello world")))));
        let (dispatcher, cache) = start(config(2), runner.clone());

        let job = input(b"image-1");
        let key = job.key;
        let accepted = dispatcher.submit(job).unwrap();
        assert_eq!(accepted.status, JobStatus::Pending);

        let done = wait_terminal(&dispatcher, accepted.job_id).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert_eq!(cache.lookup(&key).unwrap().joined_text, "hello world");

        match dispatcher.result(accepted.job_id).unwrap() {
            JobOutcome::Ready(result) => assert_eq!(result.joined_text, "hello world"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_submits_share_job() {
        let mut runner = ScriptedRunner::new(Box::new(|_| Ok(recognized("same"))));
        runner.delay = Duration::from_millis(100);
        let runner = Arc::new(runner);
        let (dispatcher, _) = start(config(2), runner.clone());

        let first = dispatcher.submit(input(b"same-bytes")).unwrap();
        let second = dispatcher.submit(input(b"same-bytes")).unwrap();
        let other = dispatcher.submit(input(b"other-bytes")).unwrap();

        assert_eq!(first.job_id, second.job_id);
        assert_ne!(first.job_id, other.job_id);

        wait_terminal(&dispatcher, first.job_id).await;
        wait_terminal(&dispatcher, other.job_id).await;
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_key_short_circuits() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| Ok(recognized("fresh")))));
        let (dispatcher, cache) = start(config(1), runner.clone());

        let job = input(b"cached");
        cache.insert(job.key, Arc::new(recognized("cached text")));

        let snapshot = dispatcher.submit(job).unwrap();
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        assert_eq!(snapshot.attempts, 0);
        assert_eq!(runner.calls(), 0);
        assert!(matches!(
            dispatcher.result(snapshot.job_id).unwrap(),
            JobOutcome::Ready(r) if r.joined_text == "cached text"
        ));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|n| {
            if n == 0 {
                Err(OcrError::BackendUnavailable("engine crashed".into()))
            } else {
                Ok(recognized("second try"))
            }
        })));
        let (dispatcher, _) = start(config(1), runner.clone());

        let job = dispatcher.submit(input(b"flaky")).unwrap();
        let done = wait_terminal(&dispatcher, job.job_id).await;

        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 2);
        assert!(done.error.is_none());
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_three_failures_are_terminal() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| {
            Err(OcrError::BackendUnavailable("all variants failed".into()))
        })));
        let (dispatcher, cache) = start(config(2), runner.clone());

        let job = input(b"hopeless");
        let key = job.key;
        let accepted = dispatcher.submit(job).unwrap();
        let done = wait_terminal(&dispatcher, accepted.job_id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 3);
        assert_eq!(done.error, Some(ErrorKind::BackendUnavailable));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.calls(), 3);
        assert!(cache.lookup(&key).is_none());
        assert!(matches!(
            dispatcher.result(accepted.job_id).unwrap(),
            JobOutcome::Failed(OcrError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| {
            Err(OcrError::InvalidImage("not a png".into()))
        })));
        let (dispatcher, _) = start(config(1), runner.clone());

        let job = dispatcher.submit(input(b"junk")).unwrap();
        let done = wait_terminal(&dispatcher, job.job_id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.error, Some(ErrorKind::ClientInput));
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let mut runner = ScriptedRunner::new(Box::new(|_| Ok(recognized("too late"))));
        runner.delay = Duration::from_secs(2);
        let runner = Arc::new(runner);
        let mut cfg = config(1);
        cfg.task_timeout = Duration::from_millis(50);
        let (dispatcher, _) = start(cfg, runner.clone());

        let job = dispatcher.submit(input(b"slow")).unwrap();
        let done = wait_terminal(&dispatcher, job.job_id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.error, Some(ErrorKind::Timeout));
        assert!(done.detail.unwrap().starts_with("Job timed out after"));
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_never_runs() {
        let gate = Arc::new(Semaphore::new(0));
        let mut runner = ScriptedRunner::new(Box::new(|_| Ok(recognized("done"))));
        runner.gate = Some(gate.clone());
        let runner = Arc::new(runner);
        let (dispatcher, _) = start(config(1), runner.clone());

        let blocking = dispatcher.submit(input(b"first")).unwrap();
        wait_for(&dispatcher, blocking.job_id, |s| s.status == JobStatus::Running).await;

        let queued = dispatcher.submit(input(b"second")).unwrap();
        let cancelled = dispatcher.cancel(queued.job_id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        gate.add_permits(10);
        wait_terminal(&dispatcher, blocking.job_id).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(runner.calls(), 1);
        assert_eq!(dispatcher.status(queued.job_id).unwrap().status, JobStatus::Cancelled);
        assert!(matches!(
            dispatcher.result(queued.job_id).unwrap(),
            JobOutcome::Failed(OcrError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_discards_late_result() {
        let gate = Arc::new(Semaphore::new(0));
        let mut runner = ScriptedRunner::new(Box::new(|_| Ok(recognized("late"))));
        runner.gate = Some(gate.clone());
        let runner = Arc::new(runner);
        let (dispatcher, cache) = start(config(1), runner.clone());

        let job = input(b"running");
        let key = job.key;
        let accepted = dispatcher.submit(job).unwrap();
        wait_for(&dispatcher, accepted.job_id, |s| s.status == JobStatus::Running).await;

        dispatcher.cancel(accepted.job_id).unwrap();
        gate.add_permits(1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(runner.calls(), 1);
        assert_eq!(
            dispatcher.status(accepted.job_id).unwrap().status,
            JobStatus::Cancelled
        );
        assert!(cache.lookup(&key).is_none());

        // A cancelled key no longer dedups: a new submit creates a new job
        let again = dispatcher.submit(input(b"running")).unwrap();
        assert_ne!(again.job_id, accepted.job_id);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| Ok(recognized("ok")))));
        let (dispatcher, _) = start(config(1), runner);

        let job = dispatcher.submit(input(b"quick")).unwrap();
        wait_terminal(&dispatcher, job.job_id).await;

        let snapshot = dispatcher.cancel(job.job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_full_queue_is_service_unavailable() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| Ok(recognized("x")))));
        let cache = ResultCache::new(Duration::from_secs(60), 10);
        let dispatcher = JobDispatcher::start(
            config(0),
            Arc::new(ChannelQueue::new(1)),
            runner,
            Arc::new(InFlight::new(cache.clone())),
            cache,
        );

        dispatcher.submit(input(b"a")).unwrap();
        let err = dispatcher.submit(input(b"b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(dispatcher.job_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| Ok(recognized("x")))));
        let (dispatcher, _) = start(config(1), runner);

        let missing = JobId::new();
        assert!(matches!(
            dispatcher.status(missing),
            Err(OcrError::JobNotFound(id)) if id == missing
        ));
        assert!(dispatcher.cancel(missing).is_err());
    }

    #[tokio::test]
    async fn test_purge_finished_keeps_active_jobs() {
        let gate = Arc::new(Semaphore::new(0));
        let mut runner = ScriptedRunner::new(Box::new(|n| {
            if n == 0 {
                Ok(recognized("finished"))
            } else {
                Ok(recognized("still going"))
            }
        }));
        runner.gate = Some(gate.clone());
        let runner = Arc::new(runner);
        let (dispatcher, _) = start(config(1), runner);

        gate.add_permits(1);
        let finished = dispatcher.submit(input(b"done")).unwrap();
        wait_terminal(&dispatcher, finished.job_id).await;
        let active = dispatcher.submit(input(b"active")).unwrap();

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(dispatcher.purge_finished_at(later), 1);
        assert!(dispatcher.status(finished.job_id).is_err());
        assert!(dispatcher.status(active.job_id).is_ok());

        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_shutdown_joins_workers() {
        let runner = Arc::new(ScriptedRunner::new(Box::new(|_| Ok(recognized("x")))));
        let (dispatcher, _) = start(config(3), runner);

        let job = dispatcher.submit(input(b"before shutdown")).unwrap();
        wait_terminal(&dispatcher, job.job_id).await;

        dispatcher.shutdown().await;
        let err = dispatcher.submit(input(b"after shutdown")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    }
}
