//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// One chat message in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Content plus token accounting from one completion.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Errors from the LLM boundary.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("llm endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("llm call exceeded {0:?}")]
    Timeout(Duration),

    #[error("llm returned an empty response")]
    EmptyResponse,
}

impl LlmError {
    /// 429 and 5xx responses, timeouts and connection failures are worth a
    /// bounded retry; everything else (auth, bad request) is not.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Timeout(_) => true,
            LlmError::EmptyResponse => false,
        }
    }
}

/// Seam for the extractor; production uses [`OpenAiCompatClient`], tests a
/// scripted mock.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatCompletion, LlmError>;

    fn model_name(&self) -> &str;
}

/// Connection settings for the chat endpoint.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL up to and excluding `/chat/completions`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Deterministic extraction wants a low temperature.
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl OpenAiCompatClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { http, settings })
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatCompletion, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "response_format": { "type": "json_object" },
            "max_tokens": self.settings.max_tokens,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let wire: WireResponse = response.json().await?;
        let content = wire
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)?;

        let (prompt_tokens, completion_tokens) = wire
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));

        debug!(
            model = %self.settings.model,
            prompt_tokens,
            completion_tokens,
            "chat completion received"
        );

        Ok(ChatCompletion {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriability_classification() {
        assert!(LlmError::Status {
            status: 429,
            body: String::new()
        }
        .is_retriable());
        assert!(LlmError::Status {
            status: 503,
            body: String::new()
        }
        .is_retriable());
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(!LlmError::Status {
            status: 401,
            body: String::new()
        }
        .is_retriable());
        assert!(!LlmError::Status {
            status: 400,
            body: String::new()
        }
        .is_retriable());
        assert!(!LlmError::EmptyResponse.is_retriable());
    }

    #[test]
    fn wire_response_parses_with_and_without_usage() {
        let full = r#"{"choices":[{"message":{"content":"{}"}}],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
        let wire: WireResponse = serde_json::from_str(full).unwrap();
        assert_eq!(wire.usage.as_ref().unwrap().prompt_tokens, Some(10));

        let bare = r#"{"choices":[{"message":{"content":"hello"}}]}"#;
        let wire: WireResponse = serde_json::from_str(bare).unwrap();
        assert!(wire.usage.is_none());
        assert_eq!(wire.choices[0].message.content.as_deref(), Some("hello"));
    }
}
