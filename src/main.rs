//! OCR Gateway - cached, multi-variant document recognition server.

mod cache;
mod config;
mod error;
mod evaluator;
mod fingerprint;
mod identifiers;
mod jobs;
mod ocr;
mod orchestrator;
mod pdf;
mod preprocess;
mod schema;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use cache::CacheStats;
use config::Settings;
use error::{ErrorKind, OcrError};
use jobs::{JobId, JobSnapshot};
use orchestrator::{JobResultReply, Orchestrator, RecognitionRequest};
use schema::{ErrorBody, HealthResponse, IdentifiersResponse, JobAccepted, RecognitionResponse};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ocr_gateway=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;

    let orchestrator = Arc::new(Orchestrator::from_settings(&settings)?);
    let maintenance = orchestrator.spawn_maintenance(settings.sweep_interval);

    let state = AppState {
        orchestrator: orchestrator.clone(),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/ocr", post(recognize))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/jobs/:id/result", get(get_job_result))
        .route("/cache/stats", get(cache_stats))
        .route("/identifiers", post(extract_identifiers))
        // Multipart framing on top of the largest accepted file
        .layer(DefaultBodyLimit::max(settings.max_file_size + 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    orchestrator.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Errors
// ============================================================================

/// Error response carrying a status code and `{"error", "detail"}` body.
struct ApiError(StatusCode, ErrorBody);

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self(
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: ErrorKind::ClientInput,
                detail: detail.into(),
            },
        )
    }
}

impl From<OcrError> for ApiError {
    fn from(e: OcrError) -> Self {
        let kind = e.kind();
        let status = match kind {
            ErrorKind::ClientInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
        };
        if status.is_server_error() {
            error!("Request failed: {}", e);
        } else {
            warn!("Request rejected: {}", e);
        }
        Self(
            status,
            ErrorBody {
                error: kind,
                detail: e.to_string(),
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.orchestrator.health())
}

#[derive(serde::Deserialize)]
struct RecognizeQuery {
    backend: Option<String>,
    lang: Option<String>,
}

/// Recognize an uploaded file and respond with the result.
async fn recognize(
    State(state): State<AppState>,
    Query(query): Query<RecognizeQuery>,
    multipart: Multipart,
) -> Result<Json<RecognitionResponse>, ApiError> {
    let request = read_upload(multipart, query).await?;
    info!(
        "Received file: {} ({} bytes)",
        request.filename,
        request.bytes.len()
    );

    let response = state.orchestrator.recognize_sync(request).await?;
    Ok(Json(response))
}

/// Queue an uploaded file for background recognition.
async fn submit_job(
    State(state): State<AppState>,
    Query(query): Query<RecognizeQuery>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let request = read_upload(multipart, query).await?;
    let accepted = state.orchestrator.submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Get a job's status.
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.orchestrator.job_status(job_id)?))
}

/// Get a job's result: 200 when ready, 202 with the status while running.
async fn get_job_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&id)?;
    let response = match state.orchestrator.job_result(job_id)? {
        JobResultReply::Ready(result) => Json(result).into_response(),
        JobResultReply::NotReady(snapshot) => (StatusCode::ACCEPTED, Json(snapshot)).into_response(),
    };
    Ok(response)
}

/// Cancel a job.
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.orchestrator.cancel_job(job_id)?))
}

/// Cache counters.
async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.orchestrator.cache_stats())
}

#[derive(serde::Deserialize)]
struct IdentifiersRequest {
    text: String,
}

/// Extract document identifiers from plain text.
async fn extract_identifiers(
    State(state): State<AppState>,
    Json(body): Json<IdentifiersRequest>,
) -> Json<IdentifiersResponse> {
    Json(state.orchestrator.extract_identifiers(&body.text))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Read the `file` field of a multipart upload.
async fn read_upload(
    mut multipart: Multipart,
    query: RecognizeQuery,
) -> Result<RecognitionRequest, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read file: {}", e)))?
                .to_vec();
            return Ok(RecognitionRequest {
                filename,
                bytes,
                backend: query.backend,
                language: query.lang,
            });
        }
    }

    Err(ApiError::bad_request("No file uploaded"))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid job id: {}", raw)))
}
