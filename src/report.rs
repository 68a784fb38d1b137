//! Session report generator
//!
//! Reduces a chat's score history and final drift state into three 0-100
//! health scores, a verdict per dimension, score curves and optional
//! narrative insights.
//!
//! With `acc = 1 - |score - target|` and `dev = |score - target|` over every
//! observed (message, dimension) pair:
//!
//! - resilience = 0.35 * mean accuracy of the first 3 scored messages
//!   + 0.50 * tolerance * (1 - mean dev)
//!   + 0.15 * (no correction ever fired)
//!   where tolerance is the per-dimension fraction of scores within threshold
//!   over the first 20 scored messages, averaged over dimensions.
//! - quality = (0.5 * mean acc + 0.3 / (1 + 10 * var(dev)) + 0.2 * (1 - worst
//!   per-dimension mean dev)) * (0.5 + 0.5 * coverage), coverage being the
//!   fraction of active dimensions that were ever scored.
//! - compatibility = 0.4 * fraction never ceilinged + 0.3 * correction load
//!   + 0.3 * end-state health. Load is `1 - min(1, 3 * corrections / messages)`,
//!   halved when nothing was ever corrected although mean dev exceeded the
//!   threshold.
//!
//! Each score is scaled to 0-100, clamped and rounded to one decimal. An empty
//! history scores 0 across the board.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::backend::{analyze, AnalysisBackend, ChatMessage};
use crate::db::{ReportIndexEntry, Store};
use crate::dimensions::ActiveDimension;
use crate::drift::{mean, smooth};
use crate::error::Result;
use crate::logging;
use crate::session::SessionState;
use crate::settings::DriftSettings;

const EARLY_MESSAGES: usize = 3;
const TOLERANCE_WINDOW: usize = 20;
const VOLATILE_MIN_SCORES: usize = 5;
const MIN_SCORES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Corrections were exhausted and the dimension is still ceilinged.
    Ceiling,
    /// Never triggered and stayed near target.
    NaturalFit,
    /// Triggered, recovered without needing a correction.
    Maintainable,
    /// Triggered, was corrected, now within threshold.
    Correctable,
    /// Triggered and still out of tolerance.
    Drifting,
    /// Never triggered, yet far from target on average.
    Volatile,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionReport {
    pub id: String,
    pub target: f64,
    pub sample_count: usize,
    pub mean_score: Option<f64>,
    pub mean_deviation: Option<f64>,
    pub current_deviation: Option<f64>,
    pub ever_triggered: bool,
    pub ever_corrected: bool,
    pub ever_ceilinged: bool,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub message_id: usize,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportCurves {
    /// Raw observed scores per dimension.
    pub dimensions: BTreeMap<String, Vec<CurvePoint>>,
    /// Mean accuracy per scored message.
    pub accuracy: Vec<CurvePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub id: String,
    pub chat_id: String,
    pub character: String,
    pub model: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub messages_scored: u64,
    pub corrections_injected: u64,
    pub resilience: f64,
    pub quality: f64,
    pub compatibility: f64,
    pub dimensions: Vec<DimensionReport>,
    pub curves: ReportCurves,
    pub insights: Option<String>,
}

impl SessionReport {
    pub fn index_entry(&self) -> ReportIndexEntry {
        ReportIndexEntry {
            id: self.id.clone(),
            chat_id: self.chat_id.clone(),
            character: self.character.clone(),
            model: self.model.clone(),
            resilience: self.resilience,
            quality: self.quality,
            compatibility: self.compatibility,
            messages_scored: self.messages_scored as i64,
            corrections_injected: self.corrections_injected as i64,
            created_at: self.generated_at.to_rfc3339(),
        }
    }

    pub fn verdict(&self, dimension_id: &str) -> Option<Verdict> {
        self.dimensions.iter().find(|d| d.id == dimension_id).map(|d| d.verdict)
    }
}

/// Deviations of one dimension in history order, with message ids.
fn deviations(state: &SessionState, dim: &ActiveDimension) -> Vec<(usize, f64)> {
    state
        .history
        .observed_values(&dim.id)
        .into_iter()
        .map(|(id, v)| (id, (v - dim.target).abs()))
        .collect()
}

/// Last drift deviation when available, otherwise smoothed from history.
fn current_deviation(state: &SessionState, dim: &ActiveDimension, window: usize) -> Option<f64> {
    if let Some(d) = state.last_drift.as_ref().and_then(|r| r.get(&dim.id)) {
        if d.sample_count >= MIN_SCORES {
            return d.deviation;
        }
    }
    let values: Vec<f64> = state.history.observed_values(&dim.id).into_iter().map(|(_, v)| v).collect();
    let recent = &values[values.len().saturating_sub(window.max(1))..];
    smooth(recent).map(|s| (s.estimate - dim.target).abs())
}

fn classify(
    state: &SessionState,
    dim: &ActiveDimension,
    sample_count: usize,
    mean_deviation: Option<f64>,
    current: Option<f64>,
    threshold: f64,
) -> Verdict {
    if sample_count < MIN_SCORES {
        return Verdict::InsufficientData;
    }
    if state.ceiling_dimensions.contains(&dim.id) {
        return Verdict::Ceiling;
    }
    let triggered = state.cusum_triggered.contains(&dim.id) || state.fallback_triggered.contains(&dim.id);
    let within = current.is_some_and(|d| d <= threshold);
    if triggered {
        return match (within, state.ever_corrected.contains(&dim.id)) {
            (true, true) => Verdict::Correctable,
            (true, false) => Verdict::Maintainable,
            (false, _) => Verdict::Drifting,
        };
    }
    if sample_count >= VOLATILE_MIN_SCORES && mean_deviation.is_some_and(|d| d > threshold) {
        Verdict::Volatile
    } else {
        Verdict::NaturalFit
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

fn finish(raw: f64) -> f64 {
    ((raw * 100.0).clamp(0.0, 100.0) * 10.0).round() / 10.0
}

/// Build a report from the session's history and last drift state.
pub fn build_report(
    state: &SessionState,
    dimensions: &[ActiveDimension],
    drift: &DriftSettings,
    character: &str,
) -> SessionReport {
    let threshold = drift.threshold;
    let mut curves = ReportCurves::default();
    let mut dimension_reports = Vec::with_capacity(dimensions.len());
    let mut all_devs: Vec<f64> = Vec::new();
    let mut per_dim_mean_devs: Vec<f64> = Vec::new();
    let mut end_healths: Vec<f64> = Vec::new();

    for dim in dimensions {
        let devs = deviations(state, dim);
        let dev_values: Vec<f64> = devs.iter().map(|(_, d)| *d).collect();
        let scores = state.history.observed_values(&dim.id);
        let mean_score = (!scores.is_empty()).then(|| mean(&scores.iter().map(|(_, v)| *v).collect::<Vec<_>>()));
        let mean_deviation = (!dev_values.is_empty()).then(|| mean(&dev_values));
        let current = current_deviation(state, dim, drift.window);

        if let Some(m) = mean_deviation {
            per_dim_mean_devs.push(m);
        }
        if let Some(c) = current {
            end_healths.push(1.0 - c.min(1.0));
        }
        all_devs.extend(&dev_values);
        curves.dimensions.insert(
            dim.id.clone(),
            scores.iter().map(|&(message_id, value)| CurvePoint { message_id, value }).collect(),
        );

        dimension_reports.push(DimensionReport {
            id: dim.id.clone(),
            target: dim.target,
            sample_count: scores.len(),
            mean_score,
            mean_deviation,
            current_deviation: current,
            ever_triggered: state.cusum_triggered.contains(&dim.id) || state.fallback_triggered.contains(&dim.id),
            ever_corrected: state.ever_corrected.contains(&dim.id),
            ever_ceilinged: state.ever_ceilinged.contains(&dim.id),
            verdict: classify(state, dim, scores.len(), mean_deviation, current, threshold),
        });
    }

    // Per-message accuracy over active dimensions.
    for entry in state.history.iter() {
        let accs: Vec<f64> = dimensions
            .iter()
            .filter_map(|d| entry.observed(&d.id).map(|v| 1.0 - (v - d.target).abs()))
            .collect();
        if !accs.is_empty() {
            curves.accuracy.push(CurvePoint {
                message_id: entry.message_id,
                value: mean(&accs),
            });
        }
    }

    let (resilience, quality, compatibility) = if all_devs.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let mean_dev = mean(&all_devs);
        let overall_acc = 1.0 - mean_dev;
        let corrected = state.corrections_injected > 0;

        let early: Vec<f64> = curves.accuracy.iter().take(EARLY_MESSAGES).map(|p| p.value).collect();
        let reference: Vec<usize> = curves
            .accuracy
            .iter()
            .take(TOLERANCE_WINDOW)
            .map(|p| p.message_id)
            .collect();
        let tolerance_fractions: Vec<f64> = dimensions
            .iter()
            .filter_map(|dim| {
                let in_window: Vec<f64> = deviations(state, dim)
                    .into_iter()
                    .filter(|(id, _)| reference.contains(id))
                    .map(|(_, d)| d)
                    .collect();
                (!in_window.is_empty()).then(|| {
                    in_window.iter().filter(|d| **d <= threshold).count() as f64 / in_window.len() as f64
                })
            })
            .collect();
        let tolerance = mean(&tolerance_fractions) * (1.0 - mean_dev);
        let resilience = 0.35 * mean(&early) + 0.50 * tolerance + 0.15 * if corrected { 0.0 } else { 1.0 };

        let consistency = 1.0 / (1.0 + 10.0 * variance(&all_devs));
        let worst = per_dim_mean_devs.iter().copied().fold(0.0_f64, f64::max);
        let coverage = per_dim_mean_devs.len() as f64 / dimensions.len().max(1) as f64;
        let quality = (0.5 * overall_acc + 0.3 * consistency + 0.2 * (1.0 - worst)) * (0.5 + 0.5 * coverage);

        let ceilinged = dimensions.iter().filter(|d| state.ever_ceilinged.contains(&d.id)).count();
        let never_ceiling = 1.0 - ceilinged as f64 / dimensions.len().max(1) as f64;
        let messages = state.messages_scored.max(curves.accuracy.len() as u64).max(1) as f64;
        let mut load = 1.0 - (3.0 * state.corrections_injected as f64 / messages).min(1.0);
        if !corrected && mean_dev > threshold {
            load *= 0.5;
        }
        let end_health = if end_healths.is_empty() { overall_acc } else { mean(&end_healths) };
        let compatibility = 0.4 * never_ceiling + 0.3 * load + 0.3 * end_health;

        (finish(resilience), finish(quality), finish(compatibility))
    };

    SessionReport {
        id: uuid::Uuid::new_v4().to_string(),
        chat_id: state.chat_id.clone(),
        character: character.to_string(),
        model: state.model_identity.clone(),
        generated_at: Utc::now(),
        messages_scored: state.messages_scored,
        corrections_injected: state.corrections_injected,
        resilience,
        quality,
        compatibility,
        dimensions: dimension_reports,
        curves,
        insights: None,
    }
}

fn build_insights_messages(report: &SessionReport) -> Vec<ChatMessage> {
    let system_prompt = r#"You review how well a roleplay character stayed in character over a chat session. You get health scores (0-100) and a verdict per behavioral dimension.

Verdicts: natural_fit (held without help), maintainable (slipped, recovered alone), correctable (needed steering, responded), drifting (still off), volatile (off target but never flagged), ceiling (did not respond to steering), insufficient_data.

Write 3 to 5 plain sentences for the person running the chat: what held, what slipped, and one concrete suggestion for the character card or model choice. No headings, no lists."#;

    let dimensions = report
        .dimensions
        .iter()
        .map(|d| {
            format!(
                "- {}: target {:.2}, mean {}, verdict {:?}",
                d.id,
                d.target,
                d.mean_score.map(|m| format!("{:.2}", m)).unwrap_or_else(|| "n/a".into()),
                d.verdict
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let user_prompt = format!(
        "CHARACTER: {}\nMODEL: {}\nMESSAGES SCORED: {}\nCORRECTIONS: {}\nRESILIENCE: {:.1}\nQUALITY: {:.1}\nCOMPATIBILITY: {:.1}\n\nDIMENSIONS:\n{}",
        report.character,
        report.model.as_deref().unwrap_or("unknown"),
        report.messages_scored,
        report.corrections_injected,
        report.resilience,
        report.quality,
        report.compatibility,
        dimensions
    );

    vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)]
}

/// Narrative summary of a report. `None` on any failure or empty history.
pub async fn generate_insights(backend: &dyn AnalysisBackend, report: &SessionReport, max_tokens: u32) -> Option<String> {
    if report.curves.accuracy.is_empty() {
        return None;
    }
    let messages = build_insights_messages(report);
    match analyze(backend, &messages, max_tokens, false).await {
        Ok(analysis) => analysis
            .into_text()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        Err(e) => {
            logging::log_error(Some(&report.chat_id), &format!("Report insights failed: {}", e));
            None
        }
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

pub fn export_report(report: &SessionReport, path: &Path) -> Result<()> {
    write_json(report, path)?;
    logging::log_session(
        Some(&report.chat_id),
        &format!("Exported report {} to {}", report.id, path.display()),
    );
    Ok(())
}

/// Write the cross-session index; returns the number of entries written.
pub fn export_index(store: &Store, path: &Path) -> Result<usize> {
    let entries = store.list_report_index()?;
    write_json(&entries, path)?;
    logging::log_session(
        None,
        &format!("Exported report index ({} entries) to {}", entries.len(), path.display()),
    );
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DimensionScore, ScoreEntry};
    use crate::testing::ScriptedBackend;

    fn state_with(scores: &[(&str, &[f64])]) -> SessionState {
        let mut state = SessionState::new("chat-report");
        let len = scores.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        for i in 0..len {
            let mut map = BTreeMap::new();
            for (dim, values) in scores {
                if let Some(v) = values.get(i) {
                    map.insert(dim.to_string(), DimensionScore::Observed(*v));
                }
            }
            state.history.push(ScoreEntry::new(i * 2 + 1, map));
            state.messages_scored += 1;
        }
        state
    }

    fn dims(targets: &[(&str, f64)]) -> Vec<ActiveDimension> {
        targets.iter().map(|(id, t)| ActiveDimension::new(id, *t, "")).collect()
    }

    #[test]
    fn empty_history_scores_zero() {
        let state = SessionState::new("empty");
        let report = build_report(&state, &dims(&[("warmth", 0.8)]), &DriftSettings::default(), "Mira");
        assert_eq!((report.resilience, report.quality, report.compatibility), (0.0, 0.0, 0.0));
        assert_eq!(report.verdict("warmth"), Some(Verdict::InsufficientData));
        assert!(report.curves.accuracy.is_empty());
    }

    #[test]
    fn on_target_session_scores_full_marks() {
        let state = state_with(&[("warmth", &[0.75; 10])]);
        let report = build_report(&state, &dims(&[("warmth", 0.75)]), &DriftSettings::default(), "Mira");
        assert_eq!(report.resilience, 100.0);
        assert_eq!(report.quality, 100.0);
        assert_eq!(report.compatibility, 100.0);
        assert_eq!(report.verdict("warmth"), Some(Verdict::NaturalFit));
        assert_eq!(report.curves.dimensions["warmth"].len(), 10);
        assert_eq!(report.curves.accuracy[0].message_id, 1);
    }

    #[test]
    fn verdict_taxonomy() {
        let mut state = state_with(&[
            ("warmth", &[0.75, 0.75, 0.75]),
            ("humor", &[0.0, 0.0, 0.0]),
            ("formality", &[0.25, 0.25, 0.25, 0.25, 0.25, 0.25]),
            ("verbosity", &[0.5, 0.5]),
            ("optimism", &[0.5, 0.5, 0.5]),
            ("initiative", &[1.0]),
        ]);
        for id in ["warmth", "humor", "verbosity"] {
            state.cusum_triggered.insert(id.into());
        }
        state.fallback_triggered.insert("warmth".into());
        state.ever_corrected.insert("warmth".into());
        state.ceiling_dimensions.insert("optimism".into());
        state.ever_ceilinged.insert("optimism".into());

        let active = dims(&[
            ("warmth", 0.75),
            ("humor", 0.75),
            ("formality", 0.75),
            ("verbosity", 0.5),
            ("optimism", 0.0),
            ("initiative", 0.5),
        ]);
        let report = build_report(&state, &active, &DriftSettings::default(), "Mira");
        assert_eq!(report.verdict("warmth"), Some(Verdict::Correctable));
        assert_eq!(report.verdict("humor"), Some(Verdict::Drifting));
        assert_eq!(report.verdict("formality"), Some(Verdict::Volatile));
        assert_eq!(report.verdict("verbosity"), Some(Verdict::Maintainable));
        assert_eq!(report.verdict("optimism"), Some(Verdict::Ceiling));
        assert_eq!(report.verdict("initiative"), Some(Verdict::InsufficientData));
        assert!(report.compatibility < 100.0);
    }

    #[test]
    fn sparse_coverage_caps_quality_and_corrections_cost_resilience() {
        let mut state = state_with(&[("warmth", &[0.75; 6])]);
        let active = dims(&[("warmth", 0.75), ("humor", 0.5)]);
        let report = build_report(&state, &active, &DriftSettings::default(), "Mira");
        assert_eq!(report.quality, 75.0);
        assert_eq!(report.resilience, 100.0);

        state.corrections_injected = 1;
        let report = build_report(&state, &active, &DriftSettings::default(), "Mira");
        assert_eq!(report.resilience, 85.0);
        assert_eq!(report.compatibility, 85.0);
    }

    #[test]
    fn undetected_drift_halves_correction_load() {
        let state = state_with(&[("warmth", &[0.25; 6])]);
        let report = build_report(&state, &dims(&[("warmth", 0.75)]), &DriftSettings::default(), "Mira");
        // never ceilinged 0.4 + load 0.5 * 0.3 + end health 0.5 * 0.3
        assert_eq!(report.compatibility, 70.0);
        assert_eq!(report.verdict("warmth"), Some(Verdict::Volatile));
    }

    #[tokio::test]
    async fn insights_are_optional() {
        let state = state_with(&[("warmth", &[0.75; 4])]);
        let report = build_report(&state, &dims(&[("warmth", 0.75)]), &DriftSettings::default(), "Mira");

        let ok = ScriptedBackend::replies(vec![Ok("  Mira held her warmth throughout.  ".into())]);
        assert_eq!(
            generate_insights(&ok, &report, 300).await.as_deref(),
            Some("Mira held her warmth throughout.")
        );

        let failing = ScriptedBackend::replies(vec![]);
        assert_eq!(generate_insights(&failing, &report, 300).await, None);
    }

    #[test]
    fn exports_report_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let state = state_with(&[("warmth", &[0.75; 4])]);
        let report = build_report(&state, &dims(&[("warmth", 0.75)]), &DriftSettings::default(), "Mira");
        store.record_report(&report.index_entry()).unwrap();

        let report_path = dir.path().join("reports").join("report.json");
        export_report(&report, &report_path).unwrap();
        let parsed: SessionReport = serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(parsed.id, report.id);
        assert_eq!(parsed.verdict("warmth"), Some(Verdict::NaturalFit));

        let index_path = dir.path().join("index.json");
        assert_eq!(export_index(&store, &index_path).unwrap(), 1);
        let index: Vec<ReportIndexEntry> = serde_json::from_str(&std::fs::read_to_string(&index_path).unwrap()).unwrap();
        assert_eq!(index[0].character, "Mira");
    }
}
