//! API layer - HTTP admission and query interface
//!
//! Provides:
//! - `POST /api/v1/messages` admission
//! - `POST /api/v1/list` and `POST /api/v1/posts` paginated views
//! - `GET /api/v1/allowlist`, `GET /api/v1/karma`, `GET /api/v1/status`
//! - `GET /health`
//!
//! Every `/api/v1` reply is `{status, code, message, details, data?}`.

pub mod routes;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::admission::Admission;
use crate::moderation::ModerationCache;
use crate::query::QueryEngine;
use crate::registry::SnapshotCache;
use crate::store::LeafStore;
use crate::sync::SyncStatus;

/// State shared across handlers
pub struct ApiState {
    pub node_id: String,
    pub peer_id: Option<String>,
    pub admission: Admission,
    pub query: QueryEngine,
    pub store: Arc<LeafStore>,
    pub registry: Arc<SnapshotCache>,
    pub moderation: Arc<ModerationCache>,
    pub sync_status: watch::Receiver<SyncStatus>,
}

pub type SharedState = Arc<ApiState>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/messages", post(routes::post_message))
        .route("/list", post(routes::list_messages))
        .route("/posts", post(routes::list_posts))
        .route("/allowlist", get(routes::allowlist))
        .route("/karma", get(routes::karma))
        .route("/status", get(routes::status));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(routes::health))
        .with_state(state)
}

/// Uniform JSON reply.
#[derive(Debug, Serialize)]
pub struct ApiReply {
    pub status: &'static str,
    pub code: u16,
    pub message: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiReply {
    pub fn success(details: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            status: "success",
            code: StatusCode::OK.as_u16(),
            message: "OK".to_string(),
            details: details.into(),
            data,
        }
    }

    pub fn error(code: StatusCode, details: impl Into<String>, reason: &str) -> Self {
        let details = details.into();
        debug!(code = code.as_u16(), reason, %details, "http error");
        Self {
            status: "error",
            code: code.as_u16(),
            message: code.canonical_reason().unwrap_or("Error").to_string(),
            details,
            data: Some(serde_json::json!({ "reason": reason })),
        }
    }
}

impl IntoResponse for ApiReply {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(self)).into_response()
    }
}
