use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CaseStatus {
    Draft,
    Submitted,
    Processing,
    Completed,
    Failed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Draft => "DRAFT",
            CaseStatus::Submitted => "SUBMITTED",
            CaseStatus::Processing => "PROCESSING",
            CaseStatus::Completed => "COMPLETED",
            CaseStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(CaseStatus::Draft),
            "SUBMITTED" => Some(CaseStatus::Submitted),
            "PROCESSING" => Some(CaseStatus::Processing),
            "COMPLETED" => Some(CaseStatus::Completed),
            "FAILED" => Some(CaseStatus::Failed),
            _ => None,
        }
    }
}

/// A questionnaire submission and, once the worker has drafted it, its memorandum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub sector: Option<String>,
    pub status: CaseStatus,
    pub answers: serde_json::Value,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseSummary {
    pub id: String,
    pub title: Option<String>,
    pub sector: Option<String>,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
}
