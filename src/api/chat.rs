use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;

use super::error::ApiError;
use super::identity::Identity;
use super::AppState;
use crate::models::Message;
use crate::relay;

// GET /api/v1/chat/{case_id}/history
pub async fn chat_history(
    identity: Identity,
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .db
        .list_messages(&identity.workspace_id, &case_id)
        .await?;
    Ok(Json(messages))
}

// POST /api/v1/chat/{case_id}/stream
//
// Always answers with an event-stream body, even when the worker is down.
pub async fn stream_chat(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    body: Bytes,
) -> Response {
    relay::relay_chat(&state.worker, &case_id, &body).await
}
