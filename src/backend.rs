//! Analysis backend abstraction
//!
//! Calibration, scoring, correction text and report insights all go through
//! `AnalysisBackend`. Concrete backends: hosted Anthropic messages API,
//! OpenAI-compatible chat completions, and a local CLI bridge process.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::anthropic::AnthropicBackend;
use crate::cli_bridge::CliBridgeBackend;
use crate::error::{AnchorError, BackendError};
use crate::logging;
use crate::openai::OpenAiBackend;
use crate::settings::{BackendKind, BackendSettings};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
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
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One completion. Implementations apply their own timeout and retry.
    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32) -> Result<String, BackendError>;

    /// Cheap reachability probe.
    async fn probe(&self) -> Result<(), BackendError> {
        self.complete(&[ChatMessage::user("Say 'ok'")], 5).await.map(|_| ())
    }
}

/// Result of `analyze`.
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Text(String),
    Json(Value),
    /// JSON was expected but none could be extracted.
    Empty,
}

impl Analysis {
    pub fn into_json(self) -> Option<Value> {
        match self {
            Analysis::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Analysis::Text(t) => Some(t),
            Analysis::Json(v) => Some(v.to_string()),
            Analysis::Empty => None,
        }
    }
}

/// Run a completion and interpret it. Malformed JSON degrades to `Empty`
/// rather than failing the caller; transport errors still propagate.
pub async fn analyze(
    backend: &dyn AnalysisBackend,
    messages: &[ChatMessage],
    max_tokens: u32,
    expect_json: bool,
) -> Result<Analysis, BackendError> {
    let text = backend.complete(messages, max_tokens).await?;
    if !expect_json {
        return Ok(Analysis::Text(text.trim().to_string()));
    }
    match extract_json(&text) {
        Some(value) => Ok(Analysis::Json(value)),
        None => {
            logging::log_error(
                None,
                &format!(
                    "No JSON in {} response: {}",
                    backend.name(),
                    &text.chars().take(200).collect::<String>()
                ),
            );
            Ok(Analysis::Empty)
        }
    }
}

/// Pull the last parseable JSON object out of model output.
///
/// Responses carry free-form reasoning before the JSON, sometimes inside a
/// code fence, so every balanced `{...}` span is tried and the last one that
/// parses wins.
pub fn extract_json(text: &str) -> Option<Value> {
    let cleaned = text
        .trim()
        .trim_start_matches("```json")
        .trim_end_matches("```")
        .trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(cleaned) {
        return Some(value);
    }

    let bytes = text.as_bytes();
    let mut found = None;
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        match balanced_end(bytes, open) {
            Some(close) => {
                if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[open..=close]) {
                    found = Some(value);
                    start = close + 1;
                    continue;
                }
                start = open + 1;
            }
            None => start = open + 1,
        }
    }
    found
}

/// Index of the `}` closing the object opened at `open`, honoring strings.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ============ Retry policy ============

/// Bounded exponential backoff, parameterized per backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let spread = rand::rng().random_range(0.5..1.0);
        base.mul_f64(spread)
    }

    /// Run `op`, retrying only errors the predicate marks retryable.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let wait = self.delay(attempt);
                    logging::log_error(
                        None,
                        &format!("Attempt {} failed ({}), retrying in {:?}", attempt, e, wait),
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build the backend selected in settings.
pub fn build_backend(settings: &BackendSettings) -> Result<Arc<dyn AnalysisBackend>, AnchorError> {
    let backend: Arc<dyn AnalysisBackend> = match settings.kind {
        BackendKind::Anthropic => Arc::new(AnthropicBackend::from_settings(settings)?),
        BackendKind::OpenAi => Arc::new(OpenAiBackend::from_settings(settings)?),
        BackendKind::Cli => Arc::new(CliBridgeBackend::from_settings(settings)),
    };
    Ok(backend)
}
