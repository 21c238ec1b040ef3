//! Push endpoint for producers: `POST /ingest` (also `/forward_data`).
//!
//! The body is `{ "predictions": [...] }`, `{ "records": [...] }` or a bare
//! array. A valid body replaces the current snapshot and is delivered to
//! every subscriber before the reply is sent.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lib_relay::core::IngestError;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::relay_logic::state::AppState;

#[derive(Debug, Error)]
pub enum AppError {
    /// The body is not a record list or an accepted envelope.
    #[error("malformed ingestion body: {0}")]
    MalformedBody(String),
    /// The refresh scheduler has stopped (shutdown in progress).
    #[error("refresh scheduler is not running")]
    Unavailable,
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Malformed(msg) => AppError::MalformedBody(msg),
            IngestError::SchedulerStopped => AppError::Unavailable,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            AppError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        tracing::warn!(status = status.as_u16(), error = %self, "ingestion rejected");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct IngestReply {
    pub message: &'static str,
    pub revision: u64,
}

pub async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<IngestReply>, AppError> {
    let revision = state.ingest.submit_json(&body).await?;
    tracing::info!(revision, bytes = body.len(), "snapshot ingested");
    Ok(Json(IngestReply {
        message: "ok",
        revision,
    }))
}
