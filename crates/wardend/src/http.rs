//! HTTP surface: the stream endpoint plus the thin identity write path
//! and read endpoints the CLI consumes.
//!
//! The write path exists to trigger the core: creating an identity
//! commits the row, then enqueues its embedding computation. Everything
//! else here is deliberately minimal plumbing.

use crate::cache::{KnownFaceCache, ReloadNotice};
use crate::jobs::{Job, JobQueue};
use crate::pipeline::FrameProcessor;
use crate::session;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::prelude::*;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use warden_store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub cache: Arc<KnownFaceCache>,
    pub processor: Arc<FrameProcessor>,
    pub jobs: JobQueue,
    pub reload_tx: broadcast::Sender<ReloadNotice>,
    pub frame_timeout: Duration,
    pub similarity_threshold: f32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(session::stream_handler))
        .route("/api/identities", post(register_identity).get(list_identities))
        .route("/api/logs", get(recent_logs))
        .route("/api/status", get(status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RegisterIdentity {
    library: String,
    name: String,
    /// Base64-encoded source image containing exactly one face.
    image: String,
}

async fn register_identity(
    State(state): State<AppState>,
    Json(req): Json<RegisterIdentity>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let image = BASE64_STANDARD
        .decode(&req.image)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("image is not valid base64: {e}")))?;

    let id = state
        .store
        .create_identity(&req.library, &req.name, image)
        .await
        .map_err(internal)?;

    // The insert has committed by the time create_identity returns; only
    // now may the job observe the row.
    state.jobs.enqueue(Job::ComputeEmbedding { identity_id: id });
    tracing::info!(%id, name = req.name, "identity registered, embedding job enqueued");

    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

async fn list_identities(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let identities = state.store.list_identities().await.map_err(internal)?;
    Ok(Json(identities))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let logs = state
        .store
        .recent_logs(query.limit.unwrap_or(100))
        .await
        .map_err(internal)?;
    Ok(Json(logs))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "known_faces": state.cache.snapshot().len(),
        "similarity_threshold": state.similarity_threshold,
    }))
}

fn internal(err: warden_store::StoreError) -> (StatusCode, String) {
    tracing::error!(error = %err, "storage error");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
