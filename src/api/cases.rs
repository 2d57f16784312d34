use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::error::ApiError;
use super::identity::Identity;
use super::AppState;
use crate::models::{Case, CaseStatus, CaseSummary};

#[derive(Debug, Deserialize)]
pub struct CreateCaseRequest {
    #[serde(default)]
    pub answers: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCaseRequest {
    pub answers: serde_json::Map<String, serde_json::Value>,
}

// GET /api/v1/cases
pub async fn list_cases(
    identity: Identity,
    State(state): State<AppState>,
) -> Result<Json<Vec<CaseSummary>>, ApiError> {
    let cases = state.db.list_cases(&identity.workspace_id).await?;
    Ok(Json(cases))
}

// POST /api/v1/cases
pub async fn create_case(
    identity: Identity,
    State(state): State<AppState>,
    payload: Result<Json<CreateCaseRequest>, JsonRejection>,
) -> Result<Json<Case>, ApiError> {
    let Json(request) = payload?;
    let now = Utc::now();
    let case = Case {
        id: Uuid::new_v4().to_string(),
        workspace_id: identity.workspace_id,
        user_id: identity.user_id,
        title: None,
        sector: None,
        status: CaseStatus::Submitted,
        answers: request.answers,
        result: None,
        created_at: now,
        updated_at: now,
    };
    state.db.insert_case(&case).await?;
    tracing::info!(case_id = %case.id, "Case submitted");
    Ok(Json(case))
}

// GET /api/v1/cases/{case_id}
pub async fn get_case(
    identity: Identity,
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<Case>, ApiError> {
    state
        .db
        .get_case(&identity.workspace_id, &case_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

// PATCH /api/v1/cases/{case_id}
pub async fn update_case(
    identity: Identity,
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    payload: Result<Json<UpdateCaseRequest>, JsonRejection>,
) -> Result<Json<Case>, ApiError> {
    let Json(request) = payload?;
    let answers = serde_json::Value::Object(request.answers);
    state
        .db
        .update_case_answers(&identity.workspace_id, &case_id, &answers)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}
