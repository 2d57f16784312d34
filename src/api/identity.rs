use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use super::error::ApiError;

pub const USER_HEADER: &str = "x-user-id";
pub const WORKSPACE_HEADER: &str = "x-workspace-id";

/// Caller identity as forwarded by the identity provider in front of the API.
/// Sign-in and session handling happen there; this only reads the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub workspace_id: String,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(&parts.headers, USER_HEADER);
        let workspace_id = header_value(&parts.headers, WORKSPACE_HEADER);
        match (user_id, workspace_id) {
            (Some(user_id), Some(workspace_id)) => Ok(Identity {
                user_id,
                workspace_id,
            }),
            _ => Err(ApiError::Unauthorized),
        }
    }
}
