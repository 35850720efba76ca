//! API route handlers

use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::json;

use super::{ApiReply, SharedState};
use crate::error::{AdmissionError, QueryError, ValidationError};
use crate::message::{Identity, TrieDigest};
use crate::query::ListRequest;
use crate::ranking;
use crate::registry::RegistrySnapshot;
use crate::store::AddOutcome;
use crate::sync::PeerStatus;
use crate::validation::CandidateMessage;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

fn to_data<T: Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

fn rejection(error: &ValidationError) -> ApiReply {
    let code = match error {
        ValidationError::Unauthorized(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    };
    ApiReply::error(code, error.to_string(), error.code())
}

fn pagination_error(error: &QueryError) -> ApiReply {
    ApiReply::error(StatusCode::BAD_REQUEST, error.to_string(), error.code())
}

fn parse_list_request(body: &[u8]) -> Result<ListRequest, ApiReply> {
    serde_json::from_slice(body).map_err(|e| {
        pagination_error(&QueryError::PaginationInvalid(format!(
            "wrongly formatted request: {}",
            e
        )))
    })
}

async fn current_snapshot(state: &SharedState) -> std::sync::Arc<RegistrySnapshot> {
    state.registry.current().await.unwrap_or_default()
}

/// POST /api/v1/messages
pub async fn post_message(State(state): State<SharedState>, body: Bytes) -> ApiReply {
    let candidate: CandidateMessage = match serde_json::from_slice(&body) {
        Ok(candidate) => candidate,
        Err(e) => {
            return rejection(&ValidationError::SchemaInvalid(format!(
                "wrongly formatted message: {}",
                e
            )))
        }
    };
    let message = match candidate.into_message() {
        Ok(message) => message,
        Err(e) => return rejection(&e),
    };

    match state.admission.submit(message).await {
        Ok(AddOutcome::Inserted(leaf)) => ApiReply::success(
            "Message included",
            Some(json!({ "hash": leaf.hash, "seq": leaf.seq })),
        ),
        Ok(AddOutcome::AlreadyPresent(hash)) => {
            ApiReply::success("Message already present", Some(json!({ "hash": hash })))
        }
        Err(AdmissionError::Rejected(e)) => rejection(&e),
        Err(AdmissionError::Store(e)) => ApiReply::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
            "StoreError",
        ),
    }
}

/// POST /api/v1/list
pub async fn list_messages(State(state): State<SharedState>, body: Bytes) -> ApiReply {
    let request = match parse_list_request(&body) {
        Ok(request) => request,
        Err(reply) => return reply,
    };
    match state.query.list(&request) {
        Ok(page) => ApiReply::success(
            format!("Extracted {} leaves", page.leaves.len()),
            to_data(&page),
        ),
        Err(e) => pagination_error(&e),
    }
}

/// POST /api/v1/posts
pub async fn list_posts(State(state): State<SharedState>, body: Bytes) -> ApiReply {
    let request = match parse_list_request(&body) {
        Ok(request) => request,
        Err(reply) => return reply,
    };
    let snapshot = current_snapshot(&state).await;
    let moderation = state.moderation.current().await;
    match state.query.posts(&request, &snapshot, &moderation) {
        Ok(page) => ApiReply::success(
            format!("Extracted {} posts", page.leaves.len()),
            to_data(&page),
        ),
        Err(e) => pagination_error(&e),
    }
}

/// GET /api/v1/allowlist
pub async fn allowlist(State(state): State<SharedState>) -> ApiReply {
    let snapshot = current_snapshot(&state).await;
    let list: Vec<&Identity> = snapshot.allowlist.iter().collect();
    ApiReply::success("Returning allow list", to_data(&list))
}

/// GET /api/v1/karma
pub async fn karma(State(state): State<SharedState>) -> ApiReply {
    let snapshot = current_snapshot(&state).await;
    let moderation = state.moderation.current().await;
    let engagement = state.query.engagement(&snapshot, &moderation);
    let scores = ranking::karma(&engagement);
    let board = ranking::leaderboard(&scores, &snapshot.allowlist);
    ApiReply::success("Returning leaderboard", to_data(&board))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    node_id: String,
    peer_id: Option<String>,
    version: &'static str,
    root: TrieDigest,
    leaf_count: u64,
    registry_loaded: bool,
    peers: Vec<PeerStatus>,
}

/// GET /api/v1/status
pub async fn status(State(state): State<SharedState>) -> ApiReply {
    let peers = state.sync_status.borrow().peers.clone();
    let response = StatusResponse {
        node_id: state.node_id.clone(),
        peer_id: state.peer_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        root: state.store.root(),
        leaf_count: state.store.len(),
        registry_loaded: state.registry.current().await.is_some(),
        peers,
    };
    ApiReply::success("Returning node status", to_data(&response))
}
