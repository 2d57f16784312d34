use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid chat request: {0}")]
    InvalidRequest(String),

    #[error("Invalid worker URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP error! status: {0}")]
    UpstreamStatus(StatusCode),
}

/// Body of `POST /chat/{caseId}/stream`. Any JSON document is accepted and
/// forwarded to the worker as is; the worker owns its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatRequestBody(serde_json::Value);

impl ChatRequestBody {
    pub fn from_slice(raw: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(raw)
            .map(Self)
            .map_err(|e| RelayError::InvalidRequest(e.to_string()))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// HTTP client for the drafting worker that performs the legal analysis.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: Client,
    base_url: String,
}

impl WorkerClient {
    /// `base_url` must already be normalized (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn stream_url(&self, case_id: &str) -> Result<Url, RelayError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| RelayError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| RelayError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["chat", case_id, "stream"]);
        Ok(url)
    }

    /// Open the worker's reply stream for one chat message. Exactly one attempt;
    /// a non-success status fails before any byte is handed back.
    pub async fn open_chat_stream(
        &self,
        case_id: &str,
        body: &ChatRequestBody,
    ) -> Result<reqwest::Response, RelayError> {
        let url = self.stream_url(case_id)?;
        tracing::debug!(case_id, %url, "Forwarding chat message to worker");

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(body.as_value())
            .send()
            .await
            .map_err(|e| RelayError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::UpstreamStatus(response.status()));
        }

        Ok(response)
    }
}
