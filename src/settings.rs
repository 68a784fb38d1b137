//! Typed configuration
//!
//! Stored settings are loose JSON (older versions may lack fields, users may
//! hand-edit). `Settings::merge_with_defaults` is the single place where a
//! stored blob is overlaid on the defaults before deserializing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub enabled: bool,
    /// Inject the calibrated-profile anchor under the `baseline` key.
    pub baseline_anchor: bool,
    pub drift: DriftSettings,
    pub scoring: ScoringSettings,
    pub correction: CorrectionSettings,
    pub backend: BackendSettings,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSettings {
    /// Short window, in scored messages.
    pub window: usize,
    /// Ordinary deviation threshold.
    pub threshold: f64,
    /// Stricter threshold driving the severe trigger.
    pub alert_threshold: f64,
    /// Consecutive over-threshold cycles before the moving-average fallback fires.
    pub fallback_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringSettings {
    pub chunk_size: usize,
    pub context_turns: usize,
    /// Per-turn character budget in the conversation window.
    pub max_turn_chars: usize,
    pub history_cap: usize,
    pub unscored_warning_cycles: u32,
    pub max_tokens: u32,
    pub calibration_max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSettings {
    pub enabled: bool,
    pub max_dimensions: usize,
    pub patience: u32,
    pub max_attempts: u32,
    pub cooldown: u32,
    pub recovery_margin: f64,
    pub recovery_patience: u32,
    pub injection_depth: usize,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Anthropic,
    OpenAi,
    Cli,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Override for OpenAI-compatible endpoints.
    pub base_url: Option<String>,
    pub cli_command: String,
    pub cli_args: Vec<String>,
    pub http_timeout_secs: u64,
    pub cli_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline_anchor: true,
            drift: DriftSettings::default(),
            scoring: ScoringSettings::default(),
            correction: CorrectionSettings::default(),
            backend: BackendSettings::default(),
            log_dir: None,
        }
    }
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            window: 8,
            threshold: 0.20,
            alert_threshold: 0.35,
            fallback_cycles: 3,
        }
    }
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            chunk_size: 4,
            context_turns: 6,
            max_turn_chars: 1200,
            history_cap: 200,
            unscored_warning_cycles: 3,
            max_tokens: 600,
            calibration_max_tokens: 1200,
        }
    }
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_dimensions: 2,
            patience: 3,
            max_attempts: 3,
            cooldown: 5,
            recovery_margin: 0.05,
            recovery_patience: 2,
            injection_depth: 4,
            max_tokens: 400,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Anthropic,
            model: None,
            api_key: None,
            base_url: None,
            cli_command: "claude".to_string(),
            cli_args: vec!["-p".to_string()],
            http_timeout_secs: 60,
            cli_timeout_secs: 300,
            retry_attempts: 3,
            retry_initial_ms: 1000,
            retry_max_ms: 8000,
        }
    }
}

impl BackendSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn cli_timeout(&self) -> Duration {
        Duration::from_secs(self.cli_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Settings {
    /// Overlay a stored blob on the defaults and deserialize the result.
    ///
    /// Missing keys take their default, unknown keys are dropped, and a key
    /// whose stored type does not match the default's falls back to the default.
    pub fn merge_with_defaults(stored: &Value) -> Self {
        let defaults = Settings::default();
        let Ok(mut merged) = serde_json::to_value(&defaults) else {
            return defaults;
        };
        overlay(&mut merged, stored);
        serde_json::from_value(merged).unwrap_or(defaults)
    }
}

fn overlay(base: &mut Value, stored: &Value) {
    match (base, stored) {
        (Value::Object(base_map), Value::Object(stored_map)) => {
            for (key, base_value) in base_map.iter_mut() {
                if let Some(stored_value) = stored_map.get(key) {
                    overlay(base_value, stored_value);
                }
            }
        }
        (base_value, stored_value) => {
            if same_shape(base_value, stored_value) {
                *base_value = stored_value.clone();
            }
        }
    }
}

fn same_shape(base: &Value, stored: &Value) -> bool {
    match (base, stored) {
        // Optional fields default to null and accept any non-null value.
        (Value::Null, _) => true,
        (_, Value::Null) => false,
        (Value::Bool(_), Value::Bool(_)) => true,
        (Value::Number(a), Value::Number(b)) => a.is_f64() || !b.is_f64(),
        (Value::String(_), Value::String(_)) => true,
        (Value::Array(_), Value::Array(_)) => true,
        _ => false,
    }
}
