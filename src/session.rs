//! Per-chat session state
//!
//! `SessionState` is the only durable state the monitor owns. It is loaded
//! from the chat metadata store, mutated inside one processing cycle and
//! written back. Corrupted score entries are dropped at load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::dimensions::snap_to_discrete;
use crate::drift::DriftReport;
use crate::logging;

pub const DEFAULT_HISTORY_CAP: usize = 200;

/// One dimension's score for one reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionScore {
    Observed(f64),
    /// The reply gave no evidence either way.
    NotApplicable,
}

impl DimensionScore {
    pub fn observed(&self) -> Option<f64> {
        match self {
            DimensionScore::Observed(v) => Some(*v),
            DimensionScore::NotApplicable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub message_id: usize,
    pub timestamp: DateTime<Utc>,
    pub scores: BTreeMap<String, DimensionScore>,
}

impl ScoreEntry {
    pub fn new(message_id: usize, scores: BTreeMap<String, DimensionScore>) -> Self {
        Self {
            message_id,
            timestamp: Utc::now(),
            scores,
        }
    }

    pub fn observed(&self, dimension_id: &str) -> Option<f64> {
        self.scores.get(dimension_id).and_then(|s| s.observed())
    }

    /// Snap stored values back onto the rubric; drop non-finite ones.
    fn sanitize(&mut self) {
        self.scores.retain(|_, score| match score {
            DimensionScore::Observed(v) if v.is_finite() => {
                *v = snap_to_discrete(*v);
                true
            }
            DimensionScore::Observed(_) => false,
            DimensionScore::NotApplicable => true,
        });
    }
}

/// History ordered by message id with FIFO eviction at `cap`. A re-scored
/// older message goes back into its slot, so the back is always the newest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreHistory {
    entries: VecDeque<ScoreEntry>,
    #[serde(skip)]
    cap: usize,
}

impl Default for ScoreHistory {
    fn default() -> Self {
        Self::with_cap(DEFAULT_HISTORY_CAP)
    }
}

impl ScoreHistory {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    /// Insert in message-id order, evicting the oldest entry first when full.
    pub fn push(&mut self, entry: ScoreEntry) {
        while self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.message_id <= entry.message_id)
            .map_or(0, |p| p + 1);
        self.entries.insert(pos, entry);
    }

    /// Remove the entry for `message_id`, returning it.
    pub fn remove_message(&mut self, message_id: usize) -> Option<ScoreEntry> {
        let pos = self.entries.iter().position(|e| e.message_id == message_id)?;
        self.entries.remove(pos)
    }

    pub fn contains_message(&self, message_id: usize) -> bool {
        self.entries.iter().any(|e| e.message_id == message_id)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ScoreEntry> + ExactSizeIterator + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<&ScoreEntry> {
        self.entries.front()
    }

    pub fn last(&self) -> Option<&ScoreEntry> {
        self.entries.back()
    }

    /// Observed scores for one dimension, oldest first.
    pub fn observed_values(&self, dimension_id: &str) -> Vec<(usize, f64)> {
        self.entries
            .iter()
            .filter_map(|e| e.observed(dimension_id).map(|v| (e.message_id, v)))
            .collect()
    }
}

impl<'de> Deserialize<'de> for ScoreHistory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            entries: Vec<Value>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let total = raw.entries.len();
        let mut history = ScoreHistory::default();
        for value in raw.entries {
            if let Ok(mut entry) = serde_json::from_value::<ScoreEntry>(value) {
                entry.sanitize();
                history.push(entry);
            }
        }
        if history.len() < total {
            logging::log_error(
                None,
                &format!("Dropped {} malformed score entries at load", total - history.len()),
            );
        }
        Ok(history)
    }
}

/// The single in-flight correction of a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCorrection {
    pub enabled: bool,
    pub dimension_ids: Vec<String>,
    pub injection_text: String,
    /// Last scored message before the correction took effect.
    pub since_message: usize,
    pub attempt: u32,
    pub scores_since_correction: u32,
    pub deviation_at_injection: f64,
    pub tier: crate::correction::IntensityTier,
    #[serde(default)]
    pub grace_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub chat_id: String,
    pub history: ScoreHistory,
    pub correction: Option<ActiveCorrection>,
    pub ceiling_dimensions: BTreeSet<String>,
    pub cooldown_remaining: u32,
    pub recovery_cycles: u32,
    pub messages_scored: u64,
    pub corrections_injected: u64,
    pub cusum_triggered: BTreeSet<String>,
    pub fallback_triggered: BTreeSet<String>,
    pub ever_corrected: BTreeSet<String>,
    pub ever_ceilinged: BTreeSet<String>,
    /// Per-dimension: only scores after this message feed the CUSUM window.
    pub cusum_reset_markers: HashMap<String, usize>,
    pub fallback_streaks: HashMap<String, u32>,
    pub unscored_streaks: HashMap<String, u32>,
    /// Message indices armed for a one-shot re-score after a swipe.
    pub rescore_armed: BTreeSet<usize>,
    pub model_identity: Option<String>,
    pub last_drift: Option<DriftReport>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            chat_id: String::new(),
            history: ScoreHistory::default(),
            correction: None,
            ceiling_dimensions: BTreeSet::new(),
            cooldown_remaining: 0,
            recovery_cycles: 0,
            messages_scored: 0,
            corrections_injected: 0,
            cusum_triggered: BTreeSet::new(),
            fallback_triggered: BTreeSet::new(),
            ever_corrected: BTreeSet::new(),
            ever_ceilinged: BTreeSet::new(),
            cusum_reset_markers: HashMap::new(),
            fallback_streaks: HashMap::new(),
            unscored_streaks: HashMap::new(),
            rescore_armed: BTreeSet::new(),
            model_identity: None,
            last_drift: None,
            updated_at: None,
        }
    }
}

impl SessionState {
    pub fn new(chat_id: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            ..Default::default()
        }
    }

    /// Rebuild from stored JSON. A blob that cannot be read at all starts a
    /// fresh session rather than failing the chat.
    pub fn from_stored(chat_id: &str, stored: Option<&str>, history_cap: usize) -> Self {
        let mut state = match stored.map(serde_json::from_str::<SessionState>) {
            Some(Ok(state)) => state,
            Some(Err(e)) => {
                logging::log_error(
                    Some(chat_id),
                    &format!("Session state unreadable, starting fresh: {}", e),
                );
                SessionState::default()
            }
            None => SessionState::default(),
        };
        state.chat_id = chat_id.to_string();
        state.history.set_cap(history_cap);
        state
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Record a model identity; returns true when it changed from a known one.
    pub fn observe_model(&mut self, model: &str) -> bool {
        let changed = matches!(&self.model_identity, Some(prev) if prev != model);
        self.model_identity = Some(model.to_string());
        changed
    }

    pub fn last_message_id(&self) -> Option<usize> {
        self.history.last().map(|e| e.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: usize, dim: &str, v: f64) -> ScoreEntry {
        let mut scores = BTreeMap::new();
        scores.insert(dim.to_string(), DimensionScore::Observed(v));
        ScoreEntry::new(id, scores)
    }

    #[test]
    fn history_never_exceeds_cap_and_evicts_oldest() {
        let mut history = ScoreHistory::default();
        for i in 0..DEFAULT_HISTORY_CAP {
            history.push(entry(i, "warmth", 0.5));
        }
        assert_eq!(history.len(), 200);
        assert_eq!(history.first().map(|e| e.message_id), Some(0));

        history.push(entry(200, "warmth", 0.5));
        assert_eq!(history.len(), 200);
        assert_eq!(history.first().map(|e| e.message_id), Some(1));
        assert_eq!(history.last().map(|e| e.message_id), Some(200));
    }

    #[test]
    fn not_applicable_is_distinct_from_low_score() {
        let mut scores = BTreeMap::new();
        scores.insert("warmth".to_string(), DimensionScore::NotApplicable);
        scores.insert("humor".to_string(), DimensionScore::Observed(0.0));
        let e = ScoreEntry::new(3, scores);
        assert_eq!(e.observed("warmth"), None);
        assert_eq!(e.observed("humor"), Some(0.0));
        assert_eq!(e.observed("verbosity"), None);
    }

    #[test]
    fn remove_message_drops_only_that_entry() {
        let mut history = ScoreHistory::default();
        history.push(entry(1, "warmth", 0.5));
        history.push(entry(3, "warmth", 0.75));
        assert!(history.remove_message(3).is_some());
        assert!(history.remove_message(3).is_none());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn rescored_older_message_keeps_message_order() {
        let mut state = SessionState::new("chat");
        for id in [1, 3, 5] {
            state.history.push(entry(id, "warmth", 0.5));
        }
        state.history.remove_message(1);
        state.history.push(entry(1, "warmth", 0.75));
        let ids: Vec<usize> = state.history.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(state.last_message_id(), Some(5));
        assert_eq!(state.history.observed_values("warmth")[0], (1, 0.75));
    }

    #[test]
    fn malformed_entries_are_filtered_at_load() {
        let stored = r#"{
            "chat_id": "old",
            "history": { "entries": [
                {"message_id": 1, "timestamp": "2026-01-01T00:00:00Z", "scores": {"warmth": {"observed": 0.75}}},
                {"message_id": "oops"},
                42,
                {"message_id": 4, "timestamp": "2026-01-01T00:01:00Z", "scores": {"warmth": {"observed": 0.7}, "humor": "not_applicable"}}
            ]},
            "messages_scored": 3
        }"#;
        let state = SessionState::from_stored("chat-1", Some(stored), 200);
        assert_eq!(state.chat_id, "chat-1");
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.messages_scored, 3);
        // Off-rubric values are snapped back onto the rubric.
        assert_eq!(state.history.observed_values("warmth"), vec![(1, 0.75), (4, 0.75)]);
    }

    #[test]
    fn unreadable_blob_starts_fresh() {
        let state = SessionState::from_stored("chat-2", Some("{not json"), 200);
        assert!(state.history.is_empty());
        assert_eq!(state.chat_id, "chat-2");
    }

    #[test]
    fn round_trips_through_json() {
        let mut state = SessionState::new("chat-3");
        state.history.push(entry(2, "warmth", 0.25));
        state.ceiling_dimensions.insert("humor".into());
        let json = serde_json::to_string(&state).unwrap();
        let back = SessionState::from_stored("chat-3", Some(&json), 200);
        assert_eq!(back.history, state.history);
        assert_eq!(back.ceiling_dimensions, state.ceiling_dimensions);
    }

    #[test]
    fn model_change_detection() {
        let mut state = SessionState::new("c");
        assert!(!state.observe_model("gpt-4o"));
        assert!(!state.observe_model("gpt-4o"));
        assert!(state.observe_model("claude-sonnet"));
    }
}
