pub mod cases;
pub mod chat;
pub mod error;
pub mod health;
pub mod identity;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::API_PREFIX;
use crate::relay::WorkerClient;
use crate::services::Database;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub worker: Arc<WorkerClient>,
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/cases", get(cases::list_cases).post(cases::create_case))
        .route(
            "/cases/{case_id}",
            get(cases::get_case).patch(cases::update_case),
        )
        .route("/chat/{case_id}/history", get(chat::chat_history))
        .route("/chat/{case_id}/stream", post(chat::stream_chat))
}

/// Any origin unless one is configured. The identity headers must be allowed
/// for the chat panel to read history cross-origin.
pub fn cors_layer(allow_origin: Option<&str>) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match allow_origin {
        None | Some("*") => Ok(layer.allow_origin(Any)),
        Some(origin) => {
            let origin = HeaderValue::from_str(origin)
                .with_context(|| format!("Invalid CORS origin: {}", origin))?;
            Ok(layer.allow_origin(AllowOrigin::exact(origin)))
        }
    }
}

pub fn app(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .nest(API_PREFIX, routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
