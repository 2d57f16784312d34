use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::api::identity::{USER_HEADER, WORKSPACE_HEADER};
use crate::config::API_PREFIX;
use crate::models::Message;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Failed to send message")]
    SendFailed,

    #[error("{0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Failed to load chat history: {0}")]
    History(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

/// Streamed reply body, chunk by chunk as the relay delivers it.
pub type ReplyStream = BoxStream<'static, Result<Bytes, ChatError>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn fetch_history(&self, case_id: &str) -> Result<Vec<Message>, ChatError>;

    /// Send one message. Resolves once the relay has answered with a readable
    /// body; a non-success status is an error.
    async fn open_stream(&self, case_id: &str, message: &str) -> Result<ReplyStream, ChatError>;
}

/// Talks to the casechat back end over HTTP.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    identity: Option<(String, String)>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, user_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        self.identity = Some((user_id.into(), workspace_id.into()));
        self
    }

    fn chat_url(&self, case_id: &str, action: &str) -> Result<Url, ChatError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| ChatError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ChatError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(API_PREFIX.trim_start_matches('/').split('/'))
            .extend(["chat", case_id, action]);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.identity {
            Some((user_id, workspace_id)) => req
                .header(USER_HEADER, user_id)
                .header(WORKSPACE_HEADER, workspace_id),
            None => req,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn fetch_history(&self, case_id: &str) -> Result<Vec<Message>, ChatError> {
        let url = self.chat_url(case_id, "history")?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::History(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ChatError::History(e.to_string()))
    }

    async fn open_stream(&self, case_id: &str, message: &str) -> Result<ReplyStream, ChatError> {
        let url = self.chat_url(case_id, "stream")?;
        let response = self
            .authorize(self.client.post(url))
            .header("content-type", "application/json")
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !response.status().is_success() {
            tracing::warn!(
                case_id,
                status = response.status().as_u16(),
                "Chat relay refused the message"
            );
            return Err(ChatError::SendFailed);
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ChatError::Stream(e.to_string())))
            .boxed())
    }
}
