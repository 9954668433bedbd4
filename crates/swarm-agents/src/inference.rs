//! Inference endpoint client.
//!
//! Workers treat inference as an opaque, slow and failure-prone RPC. The
//! [`InferenceClient`] trait is the seam; [`HttpInferenceClient`] speaks JSON
//! over HTTP with `reqwest`.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::AgentRole;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::InferenceConfig;

/// Shared reference to an inference client.
pub type SharedInferenceClient = Arc<dyn InferenceClient>;

/// Error type for inference calls.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference transport error: {0}")]
    Transport(String),

    #[error("Inference request timed out")]
    Timeout,

    #[error("Inference endpoint rate limited the request")]
    RateLimited,

    #[error("Inference endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed inference response: {0}")]
    Decode(String),

    #[error("Inference rejected the request: {0}")]
    Rejected(String),
}

impl InferenceError {
    /// Network, timeout, rate-limit and 5xx failures are worth retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Rejected(_) => false,
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Request body sent to the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub action: String,
    pub task_id: String,
    pub prompt: String,
    #[serde(default)]
    pub context: Value,
    pub agent_role: AgentRole,
    pub system_prompt: String,
}

/// Response body; role-specific fields (`sources`, `files`, `charts`,
/// `issues`, ...) land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InferenceResponse {
    pub fn new(result: Value, tokens_used: u64) -> Self {
        Self {
            result,
            tokens_used,
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    /// Role-specific array field, empty when absent.
    pub fn list(&self, key: &str) -> Vec<Value> {
        self.extra
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError>;
}

/// JSON-over-HTTP inference client.
pub struct HttpInferenceClient {
    http: reqwest::Client,
    config: InferenceConfig,
}

impl HttpInferenceClient {
    pub fn new(config: InferenceConfig) -> Result<Self, InferenceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn shared(self) -> SharedInferenceClient {
        Arc::new(self)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        debug!(
            task_id = %request.task_id,
            role = %request.agent_role,
            action = %request.action,
            "Invoking inference endpoint"
        );
        let mut body = serde_json::to_value(&request).map_err(|e| InferenceError::Decode(e.to_string()))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(self.config.model.clone()));
        }

        let mut builder = self.http.post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(InferenceError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: InferenceResponse = response.json().await?;
        if let Some(message) = &parsed.error {
            return Err(InferenceError::Rejected(message.clone()));
        }
        Ok(parsed)
    }
}

/// Check whether an inference endpoint answers at all.
pub async fn check_endpoint(url: &str) -> bool {
    match reqwest::Client::new()
        .get(url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => !resp.status().is_server_error(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recoverable_classification() {
        assert!(InferenceError::Timeout.is_recoverable());
        assert!(InferenceError::RateLimited.is_recoverable());
        assert!(InferenceError::Transport("connection reset".into()).is_recoverable());
        assert!(InferenceError::Status { status: 503, body: String::new() }.is_recoverable());
        assert!(!InferenceError::Status { status: 400, body: String::new() }.is_recoverable());
        assert!(!InferenceError::Rejected("bad prompt".into()).is_recoverable());
    }

    #[test]
    fn test_response_keeps_role_fields() {
        let response: InferenceResponse = serde_json::from_value(json!({
            "result": "done",
            "tokensUsed": 42,
            "sources": [{"url": "https://example.org"}],
        }))
        .unwrap();
        assert_eq!(response.tokens_used, 42);
        assert_eq!(response.list("sources").len(), 1);
        assert!(response.list("files").is_empty());
    }

    #[test]
    fn test_request_wire_shape() {
        let request = InferenceRequest {
            action: "research".into(),
            task_id: "t1".into(),
            prompt: "p".into(),
            context: json!({}),
            agent_role: AgentRole::Researcher,
            system_prompt: "s".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["agentRole"], "researcher");
        assert_eq!(value["systemPrompt"], "s");
        assert_eq!(value["taskId"], "t1");
    }
}
