// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! OpenAI-compatible chat-completion wire types and HTTP client.
//!
//! The turn engine drives conversation turns through the [`ChatClient`]
//! seam; [`OpenAiChatClient`] is the production implementation speaking the
//! OpenAI wire format (messages array, function-calling tools block,
//! temperature, max_tokens) against any compatible endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Errors from the chat-completion endpoint.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },
    #[error("response contained no choices")]
    EmptyResponse,
}

/// Request body for `/chat/completions` (non-streaming).
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

/// Non-streaming completions response.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub message: Option<CompletionMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The assistant message of a completion choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub r#type: Option<String>,
    pub function: FunctionPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionPayload {
    pub name: String,
    /// JSON-encoded named-argument object.
    #[serde(default)]
    pub arguments: String,
}

/// Chat-completion endpoint seam. Tests substitute scripted clients.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Execute one completion call and return the assistant message.
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<CompletionMessage, LlmError>;
}

/// HTTP client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiChatClient {
    /// Create a client for `base_url` (without the `/chat/completions`
    /// suffix) authenticating with `api_key` as a bearer token.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(90))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<CompletionMessage, LlmError> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.as_ref().map(Vec::len).unwrap_or(0),
            "chat completion request"
        );

        let response = self
            .client
            .post(self.completions_url())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "chat completion endpoint returned an error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .ok_or(LlmError::EmptyResponse)
    }
}
