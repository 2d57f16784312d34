//! Same-origin relay between the chat panel and the drafting worker.
//!
//! The worker already speaks line-oriented SSE (`data: ...\n\n`, `event: error`),
//! so the relay never reframes: it forwards upstream bytes as they arrive and
//! only synthesizes an event when the worker could not be reached at all.

pub mod worker;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub use worker::{ChatRequestBody, RelayError, WorkerClient};

pub const ERROR_MESSAGE: &str = "Failed to process chat message";

fn event_stream_headers() -> [(header::HeaderName, HeaderValue); 3] {
    [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        ),
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (header::CONNECTION, HeaderValue::from_static("keep-alive")),
    ]
}

/// The single synthetic event sent when the worker call fails.
pub fn error_event() -> String {
    let payload = serde_json::json!({ "error": ERROR_MESSAGE });
    format!("data: {}\n\n", payload)
}

/// Forward one chat message and hand back the worker's body untouched.
pub async fn relay_chat(worker: &WorkerClient, case_id: &str, raw_body: &[u8]) -> Response {
    match open(worker, case_id, raw_body).await {
        Ok(upstream) => {
            tracing::info!(case_id, "Relaying worker chat stream");
            (
                StatusCode::OK,
                event_stream_headers(),
                Body::from_stream(upstream.bytes_stream()),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(case_id, "Error in chat stream: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                event_stream_headers(),
                error_event(),
            )
                .into_response()
        }
    }
}

async fn open(
    worker: &WorkerClient,
    case_id: &str,
    raw_body: &[u8],
) -> Result<reqwest::Response, RelayError> {
    let body = ChatRequestBody::from_slice(raw_body)?;
    worker.open_chat_stream(case_id, &body).await
}
