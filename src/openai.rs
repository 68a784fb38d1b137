use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{AnalysisBackend, ChatMessage, RetryPolicy};
use crate::error::{AnchorError, BackendError};
use crate::settings::BackendSettings;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: Option<u32>,
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
    content: Option<String>,
}

/// Any endpoint speaking the OpenAI chat-completions protocol.
pub struct OpenAiBackend {
    client: Client,
    api_key: Option<String>,
    url: String,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiBackend {
    pub fn from_settings(settings: &BackendSettings) -> Result<Self, AnchorError> {
        let client = Client::builder()
            .timeout(settings.http_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(BackendError::from)?;

        // Local OpenAI-compatible servers run without a key; the hosted API does not.
        if settings.base_url.is_none() && settings.api_key.is_none() {
            return Err(AnchorError::Config("OpenAI API key not configured".into()));
        }

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            url: settings
                .base_url
                .as_deref()
                .map(completions_url)
                .unwrap_or_else(|| OPENAI_API_URL.to_string()),
            model: settings.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: settings.http_timeout(),
            retry: settings.retry_policy(),
        })
    }

    async fn send_once(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, BackendError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: 0.2,
            max_tokens: Some(max_tokens),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Transport(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                backend: "OpenAI".to_string(),
                status,
                message: error_text,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::EmptyResponse("OpenAI".to_string()))
    }
}

#[async_trait]
impl AnalysisBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, BackendError> {
        self.retry.run(|| self.send_once(messages, max_tokens)).await
    }
}

/// Accept either a bare base (`http://host/v1`) or a full completions URL.
fn completions_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{}/chat/completions", trimmed)
    }
}
