//! Asynchronous job dispatch.
//!
//! A job wraps one recognition input. Submitting records the job in the
//! dispatcher's table and puts a ticket on the [`JobQueue`]; workers pull
//! tickets and drive the job through its lifecycle:
//!
//! ```text
//! Pending -> Running -> Succeeded
//!               |-> Pending (retryable failure, attempts left)
//!               |-> Failed
//! Pending | Running -> Cancelled
//! ```

mod dispatcher;
mod inflight;
mod queue;

pub use dispatcher::{DispatcherConfig, JobDispatcher};
pub use inflight::InFlight;
pub use queue::{ChannelQueue, JobQueue, JobTicket, QueueError};

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorKind, OcrError};
use crate::fingerprint::Fingerprint;
use crate::ocr::BackendKind;
use crate::schema::RecognitionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Image,
    Pdf,
}

/// Everything a worker needs to recognize one input.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub filename: String,
    pub bytes: Arc<[u8]>,
    pub kind: InputKind,
    pub backend: BackendKind,
    pub language: String,
    /// Digest of the raw bytes.
    pub fingerprint: Fingerprint,
    /// Cache and dedup key: the digest combined with backend and language.
    pub key: Fingerprint,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub filename: String,
    pub backend: BackendKind,
    pub language: String,
    pub fingerprint: Fingerprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// What `result` reports for a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Ready(Arc<RecognitionResult>),
    NotReady(JobSnapshot),
    /// Terminal failure or cancellation.
    Failed(OcrError),
}

/// Performs one attempt of recognition for a job.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, input: &JobInput) -> Result<RecognitionResult, OcrError>;
}
