//! Dimension calibration
//!
//! One backend call reads the character profile and places the character on
//! each catalog dimension, or omits dimensions that do not apply. Results are
//! cached per character and profile hash. A failed calibration never clears a
//! previous one.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::backend::{analyze, AnalysisBackend, ChatMessage};
use crate::db::Store;
use crate::dimensions::{find_dimension, profile_hash, ActiveDimension, CATALOG};
use crate::error::{AnchorError, Result};
use crate::host::CharacterProfile;
use crate::logging;

fn build_calibration_messages(profile_text: &str) -> Vec<ChatMessage> {
    let rubrics = CATALOG
        .iter()
        .map(|d| d.rubric_text())
        .collect::<Vec<_>>()
        .join("\n\n");

    let system_prompt = format!(
        r#"You calibrate a behavioral profile for a roleplay character. For each dimension below, decide where the character sits on the 0-1 scale as written in their profile, and describe in one sentence how they express that position.

DIMENSIONS:
{}

RULES:
- Use the profile, not your own defaults. A gruff mercenary is not warm just because assistants usually are.
- Targets may be any value in [0, 1]; the rubric levels are anchors.
- If the profile gives no basis for a dimension, omit it with {{"id": "...", "omit": true}}.

Respond with ONLY valid JSON in this exact format:
{{
  "dimensions": [
    {{"id": "warmth", "target": 0.8, "context": "Teases friends but always checks they are alright"}},
    {{"id": "humor", "omit": true}}
  ]
}}"#,
        rubrics
    );

    vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(format!("CHARACTER PROFILE:\n{}\n\nCalibrate:", profile_text)),
    ]
}

/// Parse a calibration response. Unknown ids, omitted dimensions and
/// entries without a finite target are dropped; an empty result is an error.
pub fn parse_calibration(value: &Value) -> Result<Vec<ActiveDimension>> {
    let entries = value
        .get("dimensions")
        .and_then(Value::as_array)
        .ok_or_else(|| AnchorError::Calibration("response has no dimensions array".into()))?;

    let mut dimensions: Vec<ActiveDimension> = Vec::new();
    for entry in entries {
        let Some(id) = entry.get("id").and_then(Value::as_str) else {
            continue;
        };
        if find_dimension(id).is_none() || dimensions.iter().any(|d| d.id == id) {
            continue;
        }
        if entry.get("omit").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let Some(target) = entry.get("target").and_then(Value::as_f64).filter(|t| t.is_finite()) else {
            continue;
        };
        let context = entry.get("context").and_then(Value::as_str).unwrap_or("");
        dimensions.push(ActiveDimension::new(id, target, context));
    }

    if dimensions.is_empty() {
        return Err(AnchorError::Calibration("no usable dimensions in response".into()));
    }
    Ok(dimensions)
}

/// Calibrate a profile with one backend call. No caching.
pub async fn calibrate_dimensions(
    backend: &dyn AnalysisBackend,
    profile_text: &str,
    max_tokens: u32,
) -> Result<Vec<ActiveDimension>> {
    if profile_text.trim().is_empty() {
        return Err(AnchorError::NoProfile);
    }
    let messages = build_calibration_messages(profile_text);
    let value = analyze(backend, &messages, max_tokens, true)
        .await?
        .into_json()
        .ok_or_else(|| AnchorError::Calibration("no JSON in response".into()))?;
    parse_calibration(&value)
}

/// How long a failed recalibration of the same profile text is not retried.
pub const RECALIBRATION_RETRY: Duration = Duration::from_secs(600);

/// Failed recalibrations per character: the profile hash tried and when.
#[derive(Debug)]
pub struct RecalibrationBackoff {
    retry_after: Duration,
    failed: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for RecalibrationBackoff {
    fn default() -> Self {
        Self::new(RECALIBRATION_RETRY)
    }
}

impl RecalibrationBackoff {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            retry_after,
            failed: Mutex::new(HashMap::new()),
        }
    }

    fn failed(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.failed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn holds(&self, key: &str, hash: &str) -> bool {
        self.failed()
            .get(key)
            .is_some_and(|(failed_hash, at)| failed_hash == hash && at.elapsed() < self.retry_after)
    }

    fn record(&self, key: &str, hash: &str) {
        self.failed().insert(key.to_string(), (hash.to_string(), Instant::now()));
    }

    fn clear(&self, key: &str) {
        self.failed().remove(key);
    }
}

/// Cached calibration for `profile`, recalibrating when the profile text
/// changed. A manual pin is always returned as-is. On failure the previous
/// calibration, if any, is kept, and the same profile text is not retried
/// until `backoff` lets it through.
pub async fn ensure_calibration(
    store: &Store,
    backend: &dyn AnalysisBackend,
    backoff: &RecalibrationBackoff,
    profile: &CharacterProfile,
    max_tokens: u32,
) -> Result<Vec<ActiveDimension>> {
    let key = profile.character_key();
    let text = profile.full_text();
    let hash = profile_hash(&text);
    let cached = store.get_calibration(&key)?;

    if let Some(cached) = &cached {
        if cached.manual || cached.profile_hash == hash {
            return Ok(cached.dimensions.clone());
        }
        if backoff.holds(&key, &hash) {
            return Ok(cached.dimensions.clone());
        }
        logging::log_calibration(
            None,
            &format!("Profile for {} changed ({} -> {}), recalibrating", profile.name, cached.profile_hash, hash),
        );
    }

    match calibrate_dimensions(backend, &text, max_tokens).await {
        Ok(dimensions) => {
            backoff.clear(&key);
            store.save_calibration(&key, &hash, &dimensions, false)?;
            logging::log_calibration(
                None,
                &format!(
                    "Calibrated {}: {}",
                    profile.name,
                    dimensions
                        .iter()
                        .map(|d| format!("{}={:.2}", d.id, d.target))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
            Ok(dimensions)
        }
        Err(e) => match cached {
            Some(previous) => {
                backoff.record(&key, &hash);
                logging::log_error(
                    None,
                    &format!(
                        "Calibration of {} failed, keeping previous for {:?}: {}",
                        profile.name, backoff.retry_after, e
                    ),
                );
                Ok(previous.dimensions)
            }
            None => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::testing::ScriptedBackend;
    use serde_json::json;

    fn profile(description: &str) -> CharacterProfile {
        CharacterProfile {
            name: "Mira".into(),
            description: description.into(),
            ..Default::default()
        }
    }

    const GOOD: &str = r#"Thinking it over...
{"dimensions": [{"id": "warmth", "target": 0.8, "context": "gentle"}, {"id": "humor", "omit": true}]}"#;

    #[test]
    fn parse_drops_unknown_omitted_and_invalid() {
        let value = json!({"dimensions": [
            {"id": "warmth", "target": 1.4, "context": "very warm"},
            {"id": "humor", "omit": true},
            {"id": "charisma", "target": 0.5},
            {"id": "formality"},
            {"id": "warmth", "target": 0.1},
            {"id": "verbosity", "target": 0.3}
        ]});
        let dims = parse_calibration(&value).unwrap();
        assert_eq!(dims.len(), 2);
        assert_eq!(dims[0].id, "warmth");
        assert_eq!(dims[0].target, 1.0);
        assert_eq!(dims[1].id, "verbosity");
        assert_eq!(dims[1].context, "");
    }

    #[test]
    fn parse_rejects_empty_result() {
        assert!(parse_calibration(&json!({"dimensions": [{"id": "humor", "omit": true}]})).is_err());
        assert!(parse_calibration(&json!({"other": 1})).is_err());
    }

    #[tokio::test]
    async fn caches_by_profile_hash() {
        let store = Store::open_in_memory().unwrap();
        let backend = ScriptedBackend::replies(vec![Ok(GOOD.into()), Ok(GOOD.replace("0.8", "0.6"))]);

        let first = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("kind"), 500).await.unwrap();
        let again = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("kind"), 500).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(backend.calls(), 1);

        let changed = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("kinder"), 500).await.unwrap();
        assert_eq!(changed[0].target, 0.6);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn failure_keeps_previous_calibration() {
        let store = Store::open_in_memory().unwrap();
        let backend = ScriptedBackend::replies(vec![Ok(GOOD.into()), Ok("no json here".into())]);
        let first = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("kind"), 500).await.unwrap();
        let after = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("different"), 500).await.unwrap();
        assert_eq!(first, after);
    }

    #[tokio::test]
    async fn failed_recalibration_is_not_retried_for_the_same_profile() {
        let store = Store::open_in_memory().unwrap();
        let backend = ScriptedBackend::replies(vec![Ok(GOOD.into()), Ok("no json here".into())]);
        let backoff = RecalibrationBackoff::default();
        let first = ensure_calibration(&store, &backend, &backoff, &profile("kind"), 500).await.unwrap();

        for _ in 0..3 {
            let kept = ensure_calibration(&store, &backend, &backoff, &profile("different"), 500).await.unwrap();
            assert_eq!(kept, first);
        }
        assert_eq!(backend.calls(), 2);

        // Another edit is a new profile text and is tried right away.
        ensure_calibration(&store, &backend, &backoff, &profile("different again"), 500).await.unwrap();
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn expired_backoff_retries_recalibration() {
        let store = Store::open_in_memory().unwrap();
        let backend = ScriptedBackend::replies(vec![
            Ok(GOOD.into()),
            Ok("no json here".into()),
            Ok(GOOD.replace("0.8", "0.6")),
        ]);
        let backoff = RecalibrationBackoff::new(Duration::ZERO);
        ensure_calibration(&store, &backend, &backoff, &profile("kind"), 500).await.unwrap();
        ensure_calibration(&store, &backend, &backoff, &profile("kinder"), 500).await.unwrap();
        let retried = ensure_calibration(&store, &backend, &backoff, &profile("kinder"), 500).await.unwrap();
        assert_eq!(retried[0].target, 0.6);
        assert_eq!(backend.calls(), 3);
        assert!(!backoff.holds("mira", &profile_hash(&profile("kinder").full_text())));
    }

    #[tokio::test]
    async fn failure_without_previous_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        let backend = ScriptedBackend::replies(vec![Err(BackendError::Timeout(std::time::Duration::from_secs(1)))]);
        let err = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("kind"), 500).await.unwrap_err();
        assert!(matches!(err, AnchorError::Backend(_)));
    }

    #[tokio::test]
    async fn manual_pin_survives_profile_change() {
        let store = Store::open_in_memory().unwrap();
        let pinned = vec![ActiveDimension::new("formality", 0.2, "casual")];
        store.pin_dimensions("mira", &pinned).unwrap();
        let backend = ScriptedBackend::replies(vec![Ok(GOOD.into())]);
        let dims = ensure_calibration(&store, &backend, &RecalibrationBackoff::default(), &profile("anything"), 500).await.unwrap();
        assert_eq!(dims, pinned);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn empty_profile_is_rejected() {
        let backend = ScriptedBackend::replies(vec![]);
        assert!(matches!(
            calibrate_dimensions(&backend, "  ", 500).await,
            Err(AnchorError::NoProfile)
        ));
    }
}
