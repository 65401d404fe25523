//! HTTP sidecar backend (PaddleOCR / EasyOCR style recognition service).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendError, BackendKind, RecognitionBackend, RecognitionFragment, SegmentationMode};

/// Sidecar request body.
#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    image: String,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<u8>,
}

/// Sidecar response (private deserialization types).
#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    fragments: Vec<SidecarFragment>,
}

#[derive(Debug, Deserialize)]
struct SidecarFragment {
    text: String,
    confidence: f64,
    #[serde(default)]
    bbox: Vec<[f32; 2]>,
}

pub struct SidecarBackend {
    url: String,
    language: String,
    client: reqwest::Client,
}

impl SidecarBackend {
    pub fn new(client: reqwest::Client, url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            language: language.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl RecognitionBackend for SidecarBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sidecar
    }

    async fn recognize(
        &self,
        image: &[u8],
        mode: SegmentationMode,
    ) -> Result<Vec<RecognitionFragment>, BackendError> {
        let body = RecognizeRequest {
            image: BASE64.encode(image),
            language: &self.language,
            mode: match mode {
                SegmentationMode::Psm(n) => Some(n),
                SegmentationMode::Auto => None,
            },
        };

        let response = self
            .client
            .post(format!("{}/recognize", self.url))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Failed(format!(
                "sidecar error ({}): {}",
                status, error_text
            )));
        }

        let raw = response.text().await?;
        let fragments = parse_response(&raw)?;
        debug!("sidecar {}: {} fragments", mode, fragments.len());
        Ok(fragments)
    }
}

fn parse_response(raw: &str) -> Result<Vec<RecognitionFragment>, BackendError> {
    let parsed: RecognizeResponse = serde_json::from_str(raw).map_err(|e| {
        BackendError::InvalidResponse(format!(
            "{}: {}",
            e,
            &raw.chars().take(200).collect::<String>()
        ))
    })?;

    Ok(parsed.fragments.into_iter().filter_map(into_fragment).collect())
}

/// Blank text and non-finite confidences are dropped.
fn into_fragment(f: SidecarFragment) -> Option<RecognitionFragment> {
    let text = f.text.trim();
    if text.is_empty() || !f.confidence.is_finite() {
        return None;
    }
    Some(RecognitionFragment::new(text, f.confidence.clamp(0.0, 1.0), f.bbox))
}
