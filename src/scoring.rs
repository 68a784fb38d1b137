//! Scoring pipeline
//!
//! Turns one character reply into a sparse dimension -> rubric-level map.
//! Dimensions are shuffled and split into small chunks, each judged by its own
//! request, so no dimension is always judged first or next to the same
//! neighbors. A chunk that fails is skipped; the cycle only fails when every
//! chunk does.

use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::backend::{analyze, AnalysisBackend, ChatMessage};
use crate::dimensions::{snap_to_discrete, ActiveDimension};
use crate::error::{AnchorError, BackendError, Result};
use crate::host::{CharacterProfile, Turn};
use crate::logging;
use crate::session::{DimensionScore, SessionState};
use crate::settings::ScoringSettings;

/// Everything needed to score one reply.
pub struct ScoringRequest<'a> {
    pub response: &'a str,
    pub profile: &'a CharacterProfile,
    /// Turns preceding the reply, already windowed.
    pub window: &'a [Turn],
    pub dimensions: &'a [ActiveDimension],
    pub message_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringOutcome {
    pub scores: BTreeMap<String, DimensionScore>,
    pub chunks: usize,
    pub failed_chunks: usize,
}

/// Keep the first and last halves of an over-long turn.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars || max_chars == 0 {
        return text.to_string();
    }
    let head = max_chars / 2;
    let tail = max_chars - head;
    let start: String = text.chars().take(head).collect();
    let end: String = text.chars().skip(count - tail).collect();
    format!("{} [...] {}", start.trim_end(), end.trim_start())
}

/// The last `context_turns` turns before `before_index`, each truncated.
pub fn conversation_window(
    turns: &[Turn],
    before_index: usize,
    context_turns: usize,
    max_turn_chars: usize,
) -> Vec<Turn> {
    let preceding: Vec<&Turn> = turns.iter().filter(|t| t.index < before_index).collect();
    preceding[preceding.len().saturating_sub(context_turns)..]
        .iter()
        .map(|t| Turn {
            index: t.index,
            author: t.author,
            text: truncate_middle(&t.text, max_turn_chars),
        })
        .collect()
}

/// Shuffle, then split into chunks of `chunk_size`.
pub fn chunk_dimensions(dimensions: &[ActiveDimension], chunk_size: usize) -> Vec<Vec<ActiveDimension>> {
    let mut shuffled = dimensions.to_vec();
    shuffled.shuffle(&mut rand::rng());
    shuffled
        .chunks(chunk_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

fn build_scoring_messages(request: &ScoringRequest<'_>, chunk: &[ActiveDimension]) -> Vec<ChatMessage> {
    let rubrics = chunk
        .iter()
        .filter_map(|d| d.catalog_entry().map(|c| c.rubric_text()))
        .collect::<Vec<_>>()
        .join("\n\n");
    let ids = chunk.iter().map(|d| format!("\"{}\"", d.id)).collect::<Vec<_>>().join(", ");

    let system_prompt = format!(
        r#"You rate one reply written by a roleplay character on behavioral dimensions. Rate what the reply actually does, not what the character is supposed to do.

RUBRICS:
{}

PROCESS:
1. For each dimension, write one short line of reasoning quoting or pointing at the reply.
2. Then output the JSON.

SCORING:
- Use only the levels 0, 0.25, 0.5, 0.75, 1.
- Use null when the reply gives no evidence for a dimension (too short, off-topic for it). null is not a low score.

End with ONLY this JSON object, covering exactly {}:
{{"scores": {{"<id>": <level or null>}}}}"#,
        rubrics, ids
    );

    let conversation = if request.window.is_empty() {
        "(start of conversation)".to_string()
    } else {
        request
            .window
            .iter()
            .map(|t| format!("{}: {}", t.author.label(), t.text))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user_prompt = format!(
        "CHARACTER: {}\n\nPROFILE:\n{}\n\nRECENT CONVERSATION:\n{}\n\nREPLY TO RATE (message {}):\n{}",
        request.profile.name,
        request.profile.full_text(),
        conversation,
        request.message_index,
        request.response
    );

    vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)]
}

fn parse_level(value: &Value) -> Option<DimensionScore> {
    match value {
        Value::Null => Some(DimensionScore::NotApplicable),
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(|v| DimensionScore::Observed(snap_to_discrete(v))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| DimensionScore::Observed(snap_to_discrete(v))),
        Value::Object(map) => map.get("score").and_then(parse_level),
        _ => None,
    }
}

/// Parse one chunk's JSON. Accepts `{"scores": {...}}` or a flat object.
/// Only ids in `chunk` are kept; `None` when nothing usable came back.
pub fn parse_chunk_scores(value: &Value, chunk: &[ActiveDimension]) -> Option<BTreeMap<String, DimensionScore>> {
    let map = value
        .get("scores")
        .and_then(Value::as_object)
        .or_else(|| value.as_object())?;

    let scores: BTreeMap<String, DimensionScore> = chunk
        .iter()
        .filter_map(|d| {
            let level = parse_level(map.get(&d.id)?)?;
            Some((d.id.clone(), level))
        })
        .collect();

    if scores.is_empty() {
        None
    } else {
        Some(scores)
    }
}

/// Score one reply across all active dimensions.
pub async fn score_response(
    backend: &dyn AnalysisBackend,
    request: &ScoringRequest<'_>,
    settings: &ScoringSettings,
    chat_id: &str,
) -> Result<ScoringOutcome> {
    if request.dimensions.is_empty() {
        return Err(AnchorError::NotCalibrated(chat_id.to_string()));
    }

    let chunks = chunk_dimensions(request.dimensions, settings.chunk_size);
    let mut scores = BTreeMap::new();
    let mut failed_chunks = 0;
    let mut last_backend_error: Option<BackendError> = None;

    for chunk in &chunks {
        let messages = build_scoring_messages(request, chunk);
        match analyze(backend, &messages, settings.max_tokens, true).await {
            Ok(analysis) => match analysis.into_json().and_then(|v| parse_chunk_scores(&v, chunk)) {
                Some(chunk_scores) => scores.extend(chunk_scores),
                None => {
                    failed_chunks += 1;
                    logging::log_error(
                        Some(chat_id),
                        &format!(
                            "Scoring chunk [{}] for message {} unparseable, skipped",
                            chunk.iter().map(|d| d.id.as_str()).collect::<Vec<_>>().join(", "),
                            request.message_index
                        ),
                    );
                }
            },
            Err(e) => {
                failed_chunks += 1;
                logging::log_error(
                    Some(chat_id),
                    &format!("Scoring chunk for message {} failed: {}", request.message_index, e),
                );
                last_backend_error = Some(e);
            }
        }
    }

    if failed_chunks == chunks.len() {
        return Err(match last_backend_error {
            Some(e) => AnchorError::Backend(e),
            None => AnchorError::Scoring(format!("all {} chunks failed", chunks.len())),
        });
    }

    logging::log_scoring(
        Some(chat_id),
        &format!(
            "Message {}: {} ({} of {} chunks ok)",
            request.message_index,
            scores
                .iter()
                .map(|(id, s)| match s {
                    DimensionScore::Observed(v) => format!("{}={:.2}", id, v),
                    DimensionScore::NotApplicable => format!("{}=n/a", id),
                })
                .collect::<Vec<_>>()
                .join(", "),
            chunks.len() - failed_chunks,
            chunks.len()
        ),
    );

    Ok(ScoringOutcome {
        scores,
        chunks: chunks.len(),
        failed_chunks,
    })
}

/// Update per-dimension unscored streaks and return a warning for each
/// dimension that just reached `warn_after` consecutive unscored cycles.
pub fn track_unscored(
    state: &mut SessionState,
    dimensions: &[ActiveDimension],
    scores: &BTreeMap<String, DimensionScore>,
    warn_after: u32,
) -> Vec<String> {
    let mut warnings = Vec::new();
    for d in dimensions {
        let observed = scores.get(&d.id).and_then(|s| s.observed()).is_some();
        let streak = state.unscored_streaks.entry(d.id.clone()).or_insert(0);
        if observed {
            *streak = 0;
            continue;
        }
        *streak += 1;
        if warn_after > 0 && *streak == warn_after {
            warnings.push(format!("{} has not been observable for {} consecutive replies", d.id, streak));
        }
    }
    warnings
}
