//! Search backend transport

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend request timed out")]
    Timeout,

    #[error("Backend transport failed: {0}")]
    Transport(String),

    #[error("Backend unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Backend rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Backend has dynamic scripting disabled: {0}")]
    ScriptingDisabled(String),

    #[error("{failed} of {total} shards failed")]
    ShardFailures { failed: u64, total: u64 },

    #[error("Backend response is not JSON: {0}")]
    Decode(String),
}

impl BackendError {
    /// Failures worth retrying with the same request
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout
                | BackendError::Transport(_)
                | BackendError::Unavailable { .. }
                | BackendError::ShardFailures { .. }
        )
    }
}

/// A search service answering faceted queries over one index
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run a search request body against `index`
    async fn search(&self, index: &str, body: &Value) -> Result<Value, BackendError>;

    /// Field mapping of `index`
    async fn mapping(&self, index: &str) -> Result<Value, BackendError>;
}

/// JSON over HTTP to a search cluster
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, BackendError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        debug!(status = status.as_u16(), bytes = text.len(), "Backend responded");
        classify(status, text)
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn search(&self, index: &str, body: &Value) -> Result<Value, BackendError> {
        let url = format!("{}/{}/_search", self.base_url, index);
        self.send(self.client.post(url).json(body)).await
    }

    async fn mapping(&self, index: &str) -> Result<Value, BackendError> {
        let url = format!("{}/{}/_mapping", self.base_url, index);
        self.send(self.client.get(url)).await
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e.to_string())
    }
}

fn classify(status: StatusCode, body: String) -> Result<Value, BackendError> {
    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()));
    }
    if status.is_server_error() {
        if scripting_disabled(&body) {
            return Err(BackendError::ScriptingDisabled(body));
        }
        return Err(BackendError::Unavailable {
            status: status.as_u16(),
            body,
        });
    }
    if scripting_disabled(&body) {
        return Err(BackendError::ScriptingDisabled(body));
    }
    Err(BackendError::Rejected {
        status: status.as_u16(),
        body,
    })
}

fn scripting_disabled(body: &str) -> bool {
    body.contains("dynamic scripting") && body.contains("disabled")
}
