//! HTTP API for narration generation and signed object downloads.
//!
//! `POST /narration` is the resume request: without `chunk_index` it ensures
//! chunk 0 exists and returns every chunk; with `chunk_index` it ensures that
//! chunk and returns it. Records carry the stable `audio_storage_key` and a
//! freshly signed `audio_url`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::journal::GenerationJournal;
use super::queue::{GenerationQueue, JobSnapshot};
use super::store::PlaybackChunk;
use crate::error::NarrationError;
use crate::storage::LocalObjectStorage;

#[derive(Clone)]
pub struct NarrationApiState {
    pub queue: Arc<GenerationQueue>,
    pub objects: Arc<LocalObjectStorage>,
    pub journal: Option<Arc<GenerationJournal>>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct NarrationRequest {
    book_id: String,
    #[serde(default)]
    voice_id: Option<String>,
    #[serde(default)]
    chunk_index: Option<u32>,
}

#[derive(Deserialize)]
struct PrefetchRequest {
    book_id: String,
    #[serde(default)]
    voice_id: Option<String>,
    #[serde(default)]
    chunk_indices: Option<Vec<u32>>,
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default = "default_report_date")]
    date: String,
}

fn default_report_date() -> String {
    "today".to_string()
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: i64,
    sig: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum NarrationResponse {
    List { chunks: Vec<PlaybackChunk> },
    Single { chunk: PlaybackChunk },
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    default_voice: String,
    jobs_queued: usize,
    jobs_running: usize,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queued: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<usize>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
            queued: None,
            deleted: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
            queued: None,
            deleted: None,
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

fn status_for(e: &NarrationError) -> StatusCode {
    match e {
        NarrationError::BookNotFound(_) => StatusCode::NOT_FOUND,
        NarrationError::ChunkOutOfRange { .. } | NarrationError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        NarrationError::Synthesis(_) | NarrationError::Upload { .. } => StatusCode::BAD_GATEWAY,
        NarrationError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<NarrationError> for ApiError {
    fn from(e: NarrationError) -> Self {
        Self {
            status: status_for(&e),
            message: e.to_string(),
        }
    }
}

impl From<Arc<NarrationError>> for ApiError {
    fn from(e: Arc<NarrationError>) -> Self {
        Self {
            status: status_for(&e),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed ({}): {}", self.status, self.message);
        }
        (self.status, Json(SimpleResponse::err(self.message))).into_response()
    }
}

/// Build the axum router.
pub fn router(state: NarrationApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/narration", post(handle_narration))
        .route("/narration/prefetch", post(handle_prefetch))
        .route("/narration/jobs", get(handle_jobs))
        .route("/narration/report", get(handle_report))
        .route("/narration/{book_id}/{voice_id}", delete(handle_delete))
        .route("/objects/{bucket}/{*key}", get(handle_object))
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve(
    state: NarrationApiState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Narration API listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

// --- Handlers ---

async fn handle_status(State(state): State<NarrationApiState>) -> Json<StatusResponse> {
    let jobs = state.queue.jobs();
    Json(StatusResponse {
        status: "ok",
        default_voice: state.queue.store().default_voice().to_string(),
        jobs_queued: jobs.iter().filter(|j| j.state == "queued").count(),
        jobs_running: jobs.iter().filter(|j| j.state == "running").count(),
    })
}

async fn handle_narration(
    State(state): State<NarrationApiState>,
    Json(req): Json<NarrationRequest>,
) -> Result<Json<NarrationResponse>, ApiError> {
    let store = state.queue.store();
    let voice_id = req
        .voice_id
        .unwrap_or_else(|| store.default_voice().to_string());
    info!(
        "HTTP /narration {}/{voice_id} chunk={:?}",
        req.book_id, req.chunk_index
    );

    match req.chunk_index {
        None => {
            let records = store.ensure_initialized(&req.book_id, &voice_id).await?;
            let chunks = store.resolve_playback(records).await?;
            Ok(Json(NarrationResponse::List { chunks }))
        }
        Some(index) => {
            let record = state
                .queue
                .submit_now(&req.book_id, &voice_id, index)
                .wait()
                .await?;
            let chunk = store
                .resolve_playback(vec![record])
                .await?
                .pop()
                .ok_or_else(|| ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "signing returned no chunk".into(),
                })?;
            Ok(Json(NarrationResponse::Single { chunk }))
        }
    }
}

async fn handle_prefetch(
    State(state): State<NarrationApiState>,
    Json(req): Json<PrefetchRequest>,
) -> Result<Json<SimpleResponse>, ApiError> {
    let voice_id = req
        .voice_id
        .unwrap_or_else(|| state.queue.store().default_voice().to_string());
    info!("HTTP /narration/prefetch {}/{voice_id}", req.book_id);

    let tickets = state
        .queue
        .prefetch(&req.book_id, &voice_id, req.chunk_indices)
        .await?;
    Ok(Json(SimpleResponse {
        queued: Some(tickets.len()),
        ..SimpleResponse::ok("queued")
    }))
}

async fn handle_jobs(State(state): State<NarrationApiState>) -> Json<Vec<JobSnapshot>> {
    Json(state.queue.jobs())
}

async fn handle_report(
    State(state): State<NarrationApiState>,
    Query(q): Query<ReportQuery>,
) -> Response {
    match &state.journal {
        Some(journal) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            journal.report(&q.date),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(SimpleResponse::err("journal disabled")),
        )
            .into_response(),
    }
}

async fn handle_delete(
    State(state): State<NarrationApiState>,
    Path((book_id, voice_id)): Path<(String, String)>,
) -> Result<Json<SimpleResponse>, ApiError> {
    info!("HTTP DELETE /narration/{book_id}/{voice_id}");
    let deleted = state.queue.store().delete_narration(&book_id, &voice_id).await?;
    Ok(Json(SimpleResponse {
        deleted: Some(deleted),
        ..SimpleResponse::ok("deleted")
    }))
}

async fn handle_object(
    State(state): State<NarrationApiState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<SignedQuery>,
) -> Response {
    if !state.objects.verify(&bucket, &key, q.expires, &q.sig) {
        return (
            StatusCode::FORBIDDEN,
            Json(SimpleResponse::err("invalid or expired signature")),
        )
            .into_response();
    }
    match state.objects.read(&bucket, &key).await {
        Ok(obj) => ([(header::CONTENT_TYPE, obj.content_type)], obj.bytes).into_response(),
        Err(e) => {
            warn!("Failed to read {bucket}/{key}: {e}");
            (StatusCode::NOT_FOUND, Json(SimpleResponse::err("object not found"))).into_response()
        }
    }
}
