use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{AnalysisBackend, ChatMessage, RetryPolicy};
use crate::error::{AnchorError, BackendError};
use crate::settings::BackendSettings;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const CLAUDE_SONNET: &str = "claude-sonnet-4-20250514";

/// Non-system turn in the Messages API shape, borrowed from a `ChatMessage`.
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
pub struct WireMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: ErrorDetails,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl AnthropicBackend {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, AnchorError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| AnchorError::Config("Anthropic API key not configured".into()))?;
        let client = Client::builder()
            .timeout(settings.http_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(BackendError::from)?;

        Ok(Self {
            client,
            api_key,
            model: settings.model.clone().unwrap_or_else(|| CLAUDE_SONNET.to_string()),
            timeout: settings.http_timeout(),
            retry: settings.retry_policy(),
        })
    }

    async fn send_once(&self, request: &MessagesRequest<'_>) -> Result<String, BackendError> {
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout)
                } else {
                    BackendError::Transport(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<AnthropicError>(&body) {
                Ok(parsed) => format!("{} - {}", parsed.error.error_type, parsed.error.message),
                Err(_) => body,
            };
            return Err(BackendError::Http {
                backend: "Anthropic".to_string(),
                status,
                message,
            });
        }

        let completion: MessagesResponse = response.json().await?;

        completion
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .last()
            .and_then(|c| c.text.clone())
            .ok_or_else(|| BackendError::EmptyResponse("Anthropic".to_string()))
    }
}

#[async_trait]
impl AnalysisBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, BackendError> {
        let (system, messages) = split_system(messages);
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            system,
            messages,
            temperature: 0.2,
        };
        self.retry.run(|| self.send_once(&request)).await
    }
}

/// The Messages API takes system text as a top-level field. Multiple system
/// messages are joined with a blank line.
pub fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage<'_>>) {
    let (system, turns): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
        messages.iter().partition(|m| m.role == "system");
    let system = (!system.is_empty()).then(|| {
        system
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    });
    let turns = turns
        .into_iter()
        .map(|m| WireMessage {
            role: &m.role,
            content: &m.content,
        })
        .collect();
    (system, turns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_lifted_and_joined() {
        let messages = vec![
            ChatMessage::system("You score replies."),
            ChatMessage::system("Be strict."),
            ChatMessage::user("Hello"),
        ];

        let (system, msgs) = split_system(&messages);

        assert_eq!(system, Some("You score replies.\n\nBe strict.".to_string()));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "Hello");
    }

    #[test]
    fn missing_key_is_rejected() {
        let settings = BackendSettings::default();
        assert!(AnthropicBackend::from_settings(&settings).is_err());
    }

    #[test]
    fn default_model_is_sonnet() {
        let settings = BackendSettings {
            api_key: Some("sk-ant-test".into()),
            ..Default::default()
        };
        let backend = AnthropicBackend::from_settings(&settings).unwrap();
        assert_eq!(backend.model, CLAUDE_SONNET);
        assert_eq!(backend.name(), "anthropic");
    }
}
