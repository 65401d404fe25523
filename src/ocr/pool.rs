//! Shared backend instances.
//!
//! Engines are expensive to start, so one instance per (kind, language) is
//! created on first use and shared afterwards. Concurrent first users wait on
//! the same initialization instead of constructing duplicates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::sidecar::SidecarBackend;
use super::tesseract::TesseractBackend;
use super::{BackendError, BackendKind, RecognitionBackend};

/// Builds backend instances for the pool.
#[async_trait::async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(
        &self,
        kind: BackendKind,
        language: &str,
    ) -> Result<Arc<dyn RecognitionBackend>, BackendError>;
}

/// Factory for the bundled backends.
pub struct DefaultBackendFactory {
    tesseract_bin: String,
    sidecar_url: Option<String>,
    client: reqwest::Client,
}

impl DefaultBackendFactory {
    pub fn new(tesseract_bin: impl Into<String>, sidecar_url: Option<String>) -> Self {
        Self {
            tesseract_bin: tesseract_bin.into(),
            sidecar_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(
        &self,
        kind: BackendKind,
        language: &str,
    ) -> Result<Arc<dyn RecognitionBackend>, BackendError> {
        match kind {
            BackendKind::Tesseract => Ok(Arc::new(
                TesseractBackend::probe(self.tesseract_bin.clone(), language).await?,
            )),
            BackendKind::Sidecar => {
                let url = self.sidecar_url.clone().ok_or_else(|| {
                    BackendError::NotAvailable("OCR_SIDECAR_URL not set".to_string())
                })?;
                Ok(Arc::new(SidecarBackend::new(self.client.clone(), url, language)))
            }
        }
    }
}

type Slot = Arc<OnceCell<Arc<dyn RecognitionBackend>>>;

/// Lazily-populated registry of backend singletons.
pub struct BackendPool {
    factory: Arc<dyn BackendFactory>,
    slots: Mutex<HashMap<(BackendKind, String), Slot>>,
}

impl BackendPool {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the shared instance for `(kind, language)`, creating it on first use.
    ///
    /// A failed initialization drops the slot, so the pool only holds
    /// backends that came up and a later call starts over.
    pub async fn get(
        &self,
        kind: BackendKind,
        language: &str,
    ) -> Result<Arc<dyn RecognitionBackend>, BackendError> {
        let key = (kind, language.to_string());
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };

        let outcome = slot
            .get_or_try_init(|| async {
                info!("Initializing {} backend (language={})", kind, language);
                self.factory.create(kind, language).await
            })
            .await
            .map(Arc::clone);

        if let Err(e) = &outcome {
            warn!("{} backend (language={}) unavailable: {}", kind, language, e);
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
            {
                slots.remove(&key);
            }
        }
        outcome
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of initialized backends.
    pub fn initialized(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{RecognitionFragment, SegmentationMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullBackend(BackendKind);

    #[async_trait::async_trait]
    impl RecognitionBackend for NullBackend {
        fn kind(&self) -> BackendKind {
            self.0
        }

        async fn recognize(
            &self,
            _image: &[u8],
            _mode: SegmentationMode,
        ) -> Result<Vec<RecognitionFragment>, BackendError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait::async_trait]
    impl BackendFactory for CountingFactory {
        async fn create(
            &self,
            kind: BackendKind,
            _language: &str,
        ) -> Result<Arc<dyn RecognitionBackend>, BackendError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(BackendError::NotAvailable("warming up".into()));
            }
            Ok(Arc::new(NullBackend(kind)))
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_once() {
        let factory = Arc::new(CountingFactory::default());
        let pool = Arc::new(BackendPool::new(factory.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.get(BackendKind::Tesseract, "eng").await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.initialized(), 1);
    }

    #[tokio::test]
    async fn test_keyed_by_kind_and_language() {
        let factory = Arc::new(CountingFactory::default());
        let pool = BackendPool::new(factory.clone());

        pool.get(BackendKind::Tesseract, "eng").await.unwrap();
        pool.get(BackendKind::Tesseract, "hin").await.unwrap();
        let sidecar = pool.get(BackendKind::Sidecar, "eng").await.unwrap();
        pool.get(BackendKind::Tesseract, "eng").await.unwrap();

        assert_eq!(sidecar.kind(), BackendKind::Sidecar);
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() {
        let factory = Arc::new(CountingFactory {
            fail_first: true,
            ..Default::default()
        });
        let pool = BackendPool::new(factory.clone());

        assert!(pool.get(BackendKind::Tesseract, "eng").await.is_err());
        assert!(pool.get(BackendKind::Tesseract, "eng").await.is_ok());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    /// Accepts only the languages it was built with.
    struct LanguageFactory(&'static [&'static str]);

    #[async_trait::async_trait]
    impl BackendFactory for LanguageFactory {
        async fn create(
            &self,
            kind: BackendKind,
            language: &str,
        ) -> Result<Arc<dyn RecognitionBackend>, BackendError> {
            if !self.0.contains(&language) {
                return Err(BackendError::UnsupportedLanguage(language.to_string()));
            }
            Ok(Arc::new(NullBackend(kind)))
        }
    }

    #[tokio::test]
    async fn test_unknown_languages_leave_no_slots() {
        let pool = BackendPool::new(Arc::new(LanguageFactory(&["eng"])));

        for n in 0..200 {
            let err = pool
                .get(BackendKind::Tesseract, &format!("junk{n}"))
                .await
                .err()
                .unwrap();
            assert!(matches!(err, BackendError::UnsupportedLanguage(_)));
        }
        assert_eq!(pool.slot_count(), 0);

        pool.get(BackendKind::Tesseract, "eng").await.unwrap();
        assert_eq!(pool.slot_count(), 1);
        assert_eq!(pool.initialized(), 1);
    }

    #[tokio::test]
    async fn test_sidecar_requires_url() {
        let factory = DefaultBackendFactory::new("tesseract", None);
        let err = factory.create(BackendKind::Sidecar, "en").await.err().unwrap();
        assert!(matches!(err, BackendError::NotAvailable(_)));
    }
}
