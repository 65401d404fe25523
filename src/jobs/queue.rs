//! Job queue seam between `submit` and the worker pool.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;

use super::JobId;
use crate::error::OcrError;

/// A unit of queued work: run `attempt` of `job_id`.
///
/// Workers drop tickets whose attempt no longer matches the job, so a ticket
/// left over from a cancelled or already-finished job is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: JobId,
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job queue is full")]
    Full,
    #[error("Job queue is closed")]
    Closed,
}

impl From<QueueError> for OcrError {
    fn from(e: QueueError) -> Self {
        OcrError::ServiceUnavailable(e.to_string())
    }
}

/// Broker for job tickets. `enqueue` never waits; a full or unavailable
/// broker is reported to the submitter instead of dropping the work.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, ticket: JobTicket) -> Result<(), QueueError>;

    /// Next ticket, or `None` once the queue is closed and drained.
    async fn dequeue(&self) -> Option<JobTicket>;

    /// Stop accepting tickets. Queued tickets are still handed out.
    fn close(&self);
}

/// In-process bounded queue over a tokio mpsc channel.
pub struct ChannelQueue {
    tx: Mutex<Option<mpsc::Sender<JobTicket>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<JobTicket>>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelQueue {
    fn enqueue(&self, ticket: JobTicket) -> Result<(), QueueError> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = tx.as_ref().ok_or(QueueError::Closed)?;
        tx.try_send(ticket).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    async fn dequeue(&self) -> Option<JobTicket> {
        self.rx.lock().await.recv().await
    }

    fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
