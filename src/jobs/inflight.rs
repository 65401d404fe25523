//! Recognitions currently running, keyed by cache key.
//!
//! Synchronous requests and job workers both go through [`InFlight::run`],
//! so at most one recognition per key runs at a time no matter which path
//! asked for it first. Later callers wait on the leader's cell and receive
//! its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::ResultCache;
use crate::error::OcrError;
use crate::fingerprint::Fingerprint;
use crate::schema::RecognitionResult;

type Cell = Arc<OnceCell<Arc<RecognitionResult>>>;

pub struct InFlight {
    cells: Mutex<HashMap<Fingerprint, Cell>>,
    cache: ResultCache,
}

impl InFlight {
    pub fn new(cache: ResultCache) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Run `recognize` for `key` unless a recognition for it is already
    /// running, in which case wait for that one instead.
    ///
    /// `store` is called with the leader's result before the key is released,
    /// so a caller arriving afterwards finds it in the cache. A failed leader
    /// releases the cell and the next waiter runs its own `recognize`.
    pub async fn run<R, S>(
        &self,
        key: Fingerprint,
        recognize: R,
        store: S,
    ) -> Result<Arc<RecognitionResult>, OcrError>
    where
        R: Future<Output = Result<RecognitionResult, OcrError>>,
        S: FnOnce(&Arc<RecognitionResult>),
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            let cell = cells.entry(key).or_default();
            if Arc::strong_count(cell) > 1 {
                debug!("Joining running recognition for {}", key);
            }
            cell.clone()
        };

        let outcome = cell
            .get_or_try_init(|| async move {
                // An earlier leader may have finished between the caller's
                // cache lookup and taking this cell.
                if let Some(result) = self.cache.lookup(&key) {
                    return Ok(result);
                }
                let result = Arc::new(recognize.await?);
                store(&result);
                Ok::<_, OcrError>(result)
            })
            .await
            .map(Arc::clone);

        self.release(&key, &cell);
        outcome
    }

    fn release(&self, key: &Fingerprint, cell: &Cell) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        if cells.get(key).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            cells.remove(key);
        }
    }

    /// Keys with a recognition running or being waited on.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
