use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::http_client::build_http_client_with_timeout;

const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Why a text-generation call produced no usable text.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(String),
    #[error("gateway returned error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
    #[error("gateway returned no content")]
    EmptyResponse,
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
}

/// The external text-generation service.
///
/// Callers pass at most one system turn, conventionally first.
#[async_trait]
pub trait LanguageModelGateway: Send + Sync {
    async fn complete(&self, messages: &[Turn], temperature: f32) -> Result<String, GatewayError>;
}

/// Run one gateway call under a deadline. A timeout or a blank reply is an
/// ordinary failure; there are no retries.
pub async fn complete_with_timeout(
    gateway: &dyn LanguageModelGateway,
    messages: &[Turn],
    temperature: f32,
    timeout: Duration,
) -> Result<String, GatewayError> {
    let text = match tokio::time::timeout(timeout, gateway.complete(messages, temperature)).await {
        Ok(result) => result?,
        Err(_) => return Err(GatewayError::Timeout(timeout)),
    };
    if text.trim().is_empty() {
        return Err(GatewayError::EmptyResponse);
    }
    Ok(text)
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            api_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            client: build_http_client_with_timeout(Some(timeout))?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LanguageModelGateway for LlmClient {
    async fn complete(&self, messages: &[Turn], temperature: f32) -> Result<String, GatewayError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|turn| Message {
                    role: turn.role.as_str(),
                    content: &turn.content,
                })
                .collect(),
            temperature,
            max_tokens: Some(DEFAULT_MAX_TOKENS),
        };

        let mut req = self.client.post(self.endpoint()).json(&request);

        // Local servers usually run without a key
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(GatewayError::Status { status, body });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GatewayError::EmptyResponse)
    }
}

/// Pull the JSON payload out of a model reply that may carry a `<think>`
/// preamble, a fenced code block, or chatter around the object.
pub fn extract_json(response: &str) -> &str {
    let cleaned = match response.rfind("</think>") {
        Some(end) => &response[end + "</think>".len()..],
        None => response,
    };
    let cleaned = cleaned.trim();

    if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + "```json".len()..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim();
        }
    }

    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned,
    }
}
