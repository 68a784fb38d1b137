//! Correction controller
//!
//! A chat is in one of three phases: Idle, Active (one correction record
//! injected) or Cooldown. Ceiling is tracked per dimension. Each scoring cycle
//! the controller first `decide`s a `Transition` from the drift report
//! without touching state, the monitor generates correction text if the
//! transition needs it, then `apply` mutates the session and says what to do
//! with the host injection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::backend::{analyze, AnalysisBackend, ChatMessage};
use crate::dimensions::{snap_to_discrete, ActiveDimension};
use crate::drift::{DimensionDrift, DriftReport, Trend};
use crate::host::{CharacterProfile, Turn};
use crate::logging;
use crate::session::{ActiveCorrection, SessionState};
use crate::settings::{CorrectionSettings, DriftSettings};

/// Aggregate deviation must fall at least this far to count as improving.
pub const IMPROVEMENT_MARGIN: f64 = 0.02;
/// Aggregate deviation must rise more than this to count as worsening.
pub const WORSENING_MARGIN: f64 = 0.05;

const SUBTLE_RATIO: f64 = 1.3;
const MODERATE_RATIO: f64 = 1.8;
const MAX_CORRECTION_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityTier {
    Subtle,
    Moderate,
    Strong,
}

impl IntensityTier {
    /// `ratio` is worst deviation over the ordinary threshold.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < SUBTLE_RATIO {
            IntensityTier::Subtle
        } else if ratio < MODERATE_RATIO {
            IntensityTier::Moderate
        } else {
            IntensityTier::Strong
        }
    }

    pub fn softer(self) -> Self {
        match self {
            IntensityTier::Strong => IntensityTier::Moderate,
            _ => IntensityTier::Subtle,
        }
    }

    pub fn stronger(self) -> Self {
        match self {
            IntensityTier::Subtle => IntensityTier::Moderate,
            _ => IntensityTier::Strong,
        }
    }

    fn guidance(self) -> &'static str {
        match self {
            IntensityTier::Subtle => "A light touch: one or two sentences nudging the character back.",
            IntensityTier::Moderate => "Clear and specific: name the behavior to return to and how it sounds.",
            IntensityTier::Strong => "Firm and explicit: the character has strayed far; state the required behavior directly with a concrete example phrase.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    Idle,
    Active,
    Cooldown,
}

pub fn phase(state: &SessionState) -> ControllerPhase {
    if state.correction.is_some() {
        ControllerPhase::Active
    } else if state.cooldown_remaining > 0 {
        ControllerPhase::Cooldown
    } else {
        ControllerPhase::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedDimension {
    pub id: String,
    pub target: f64,
    pub estimate: Option<f64>,
    pub deviation: f64,
    pub trend: Trend,
}

impl SelectedDimension {
    fn from_drift(d: &DimensionDrift) -> Self {
        Self {
            id: d.dimension_id.clone(),
            target: d.target,
            estimate: d.estimate,
            deviation: d.deviation.unwrap_or(0.0),
            trend: d.trend,
        }
    }
}

/// Dimensions chosen for one correction text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub dimensions: Vec<SelectedDimension>,
    pub tier: IntensityTier,
    /// Deviation the record starts from.
    pub deviation: f64,
}

impl Selection {
    pub fn ids(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// Every corrected dimension is trending back.
    TrendCorrecting,
    Improving,
    /// Stagnant but not worsening; allowed once per attempt.
    Grace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// Corrections are switched off; any record is dropped.
    Disabled,
    Idle,
    CooldownTick { remaining: u32 },
    Open { selection: Selection },
    /// Active, but no corrected dimension was scored this cycle.
    NotRescored,
    Waiting { scores_since: u32 },
    Recovering { confirmations: u32 },
    Hold { reason: HoldReason, deviation: f64 },
    Escalate { selection: Selection, attempt: u32 },
    Recover { dimension_ids: Vec<String>, marker: Option<usize> },
    Ceiling { dimension_ids: Vec<String>, reopen: Option<Selection> },
}

impl Transition {
    /// The selection that needs fresh correction text, with its attempt number.
    pub fn text_request(&self) -> Option<(&Selection, u32)> {
        match self {
            Transition::Open { selection } => Some((selection, 1)),
            Transition::Escalate { selection, attempt } => Some((selection, *attempt)),
            Transition::Ceiling {
                reopen: Some(selection),
                ..
            } => Some((selection, 1)),
            _ => None,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Disabled => write!(f, "disabled"),
            Transition::Idle => write!(f, "idle"),
            Transition::CooldownTick { remaining } => write!(f, "cooldown ({} left)", remaining),
            Transition::Open { selection } => write!(
                f,
                "open [{}] {:?} dev={:.3}",
                selection.ids().join(", "),
                selection.tier,
                selection.deviation
            ),
            Transition::NotRescored => write!(f, "active, corrected dimensions not rescored"),
            Transition::Waiting { scores_since } => write!(f, "active, {} scores since correction", scores_since),
            Transition::Recovering { confirmations } => write!(f, "recovering ({} confirmations)", confirmations),
            Transition::Hold { reason, deviation } => write!(f, "hold {:?} dev={:.3}", reason, deviation),
            Transition::Escalate { selection, attempt } => write!(
                f,
                "escalate attempt {} [{}] {:?}",
                attempt,
                selection.ids().join(", "),
                selection.tier
            ),
            Transition::Recover { dimension_ids, .. } => write!(f, "recovered [{}]", dimension_ids.join(", ")),
            Transition::Ceiling { dimension_ids, reopen } => write!(
                f,
                "ceiling [{}]{}",
                dimension_ids.join(", "),
                reopen
                    .as_ref()
                    .map(|s| format!(", reopening for [{}]", s.ids().join(", ")))
                    .unwrap_or_default()
            ),
        }
    }
}

/// What the host injection should do after `apply`.
#[derive(Debug, Clone, PartialEq)]
pub enum InjectionChange {
    Keep,
    Set(String),
    Clear,
}

pub struct CorrectionController {
    drift: DriftSettings,
    settings: CorrectionSettings,
}

impl CorrectionController {
    pub fn new(drift: DriftSettings, settings: CorrectionSettings) -> Self {
        Self { drift, settings }
    }

    /// Injection depth, never deeper than half the chat.
    pub fn injection_depth(&self, chat_len: usize) -> usize {
        self.settings.injection_depth.min(chat_len / 2)
    }

    /// Release ceilinged dimensions whose deviation is back within threshold.
    /// Updates the report so the same cycle sees them as correctable again.
    pub fn clear_recovered_ceilings(&self, state: &mut SessionState, report: &mut DriftReport) -> Vec<String> {
        let mut cleared = Vec::new();
        for d in report.dimensions.iter_mut().filter(|d| d.ceilinged) {
            let within = !d.insufficient_data()
                && d.deviation.is_some_and(|dev| dev <= self.drift.threshold);
            if within && state.ceiling_dimensions.remove(&d.dimension_id) {
                d.ceilinged = false;
                cleared.push(d.dimension_id.clone());
            }
        }
        if !cleared.is_empty() {
            state.last_drift = Some(report.clone());
        }
        cleared
    }

    /// Decide this cycle's transition. `rescored` holds the dimensions that
    /// received an observed score this cycle.
    pub fn decide(&self, state: &SessionState, report: &DriftReport, rescored: &BTreeSet<String>) -> Transition {
        if !self.settings.enabled {
            return match state.correction {
                Some(_) => Transition::Disabled,
                None => Transition::Idle,
            };
        }

        let Some(correction) = &state.correction else {
            // Check-then-decrement: exactly `cooldown` cycles are suppressed.
            if state.cooldown_remaining > 0 {
                return Transition::CooldownTick {
                    remaining: state.cooldown_remaining - 1,
                };
            }
            return match self.select(report, &BTreeSet::new()) {
                Some(selection) => Transition::Open { selection },
                None => Transition::Idle,
            };
        };

        self.decide_active(state, correction, report, rescored)
    }

    fn decide_active(
        &self,
        state: &SessionState,
        correction: &ActiveCorrection,
        report: &DriftReport,
        rescored: &BTreeSet<String>,
    ) -> Transition {
        let ids = &correction.dimension_ids;
        if !ids.iter().any(|id| rescored.contains(id)) {
            return Transition::NotRescored;
        }
        let scores_since = correction.scores_since_correction + 1;

        let deviation = post_correction_deviation(state, correction, report);
        let recovery_bound = self.drift.threshold - self.settings.recovery_margin;
        let every_dimension_rescored = ids
            .iter()
            .all(|id| !post_correction_scores(state, correction, id).is_empty());
        if every_dimension_rescored && deviation.is_some_and(|dev| dev <= recovery_bound) {
            let confirmations = state.recovery_cycles + 1;
            if confirmations >= self.settings.recovery_patience.max(1) {
                return Transition::Recover {
                    dimension_ids: ids.clone(),
                    marker: state.last_message_id(),
                };
            }
            return Transition::Recovering { confirmations };
        }

        if scores_since < self.settings.patience {
            return Transition::Waiting { scores_since };
        }

        let deviation = deviation.unwrap_or(correction.deviation_at_injection);
        let trends: Vec<Trend> = ids.iter().filter_map(|id| report.get(id)).map(|d| d.trend).collect();

        if !trends.is_empty() && trends.iter().all(|t| *t == Trend::Correcting) {
            return Transition::Hold {
                reason: HoldReason::TrendCorrecting,
                deviation,
            };
        }

        let worsened = deviation > correction.deviation_at_injection + WORSENING_MARGIN;
        let improved = deviation <= correction.deviation_at_injection - IMPROVEMENT_MARGIN;
        let attempts_left = correction.attempt < self.settings.max_attempts;

        if worsened && attempts_left {
            return self.escalate(correction, report, deviation);
        }
        if improved {
            return Transition::Hold {
                reason: HoldReason::Improving,
                deviation,
            };
        }
        let any_worsening = trends.iter().any(|t| *t == Trend::Drifting);
        if !worsened && !any_worsening && !correction.grace_used {
            return Transition::Hold {
                reason: HoldReason::Grace,
                deviation,
            };
        }
        if attempts_left {
            return self.escalate(correction, report, deviation);
        }

        let exclude: BTreeSet<String> = ids.iter().cloned().collect();
        Transition::Ceiling {
            dimension_ids: ids.clone(),
            reopen: self.select(report, &exclude),
        }
    }

    /// Worst-deviation correctable dimensions, up to `max_dimensions`.
    fn select(&self, report: &DriftReport, exclude: &BTreeSet<String>) -> Option<Selection> {
        let mut candidates: Vec<&DimensionDrift> = report
            .correctable()
            .filter(|d| !exclude.contains(&d.dimension_id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| {
            b.deviation
                .unwrap_or(0.0)
                .total_cmp(&a.deviation.unwrap_or(0.0))
        });
        candidates.truncate(self.settings.max_dimensions.max(1));

        let dimensions: Vec<SelectedDimension> =
            candidates.into_iter().map(SelectedDimension::from_drift).collect();
        let deviation = dimensions.iter().map(|d| d.deviation).fold(0.0, f64::max);
        let tier = self.tier_for(&dimensions, deviation, None);
        Some(Selection {
            dimensions,
            tier,
            deviation,
        })
    }

    /// Keep the corrected dimensions and fold in newly drifting ones.
    fn escalate(&self, correction: &ActiveCorrection, report: &DriftReport, deviation: f64) -> Transition {
        let mut dimensions: Vec<SelectedDimension> = correction
            .dimension_ids
            .iter()
            .filter_map(|id| report.get(id))
            .map(SelectedDimension::from_drift)
            .collect();
        let mut others: Vec<&DimensionDrift> = report
            .correctable()
            .filter(|d| !correction.dimension_ids.contains(&d.dimension_id))
            .collect();
        others.sort_by(|a, b| {
            b.deviation
                .unwrap_or(0.0)
                .total_cmp(&a.deviation.unwrap_or(0.0))
        });
        for d in others {
            if dimensions.len() >= self.settings.max_dimensions.max(1) {
                break;
            }
            dimensions.push(SelectedDimension::from_drift(d));
        }

        let worst = dimensions.iter().map(|d| d.deviation).fold(deviation, f64::max);
        let tier = self.tier_for(&dimensions, worst, Some(correction.tier));
        Transition::Escalate {
            selection: Selection {
                dimensions,
                tier,
                deviation,
            },
            attempt: correction.attempt + 1,
        }
    }

    /// Tier from the worst deviation. Fresh corrections are damped when most
    /// dimensions are already coming back; escalations are at least one step
    /// stronger than before and never below Moderate.
    fn tier_for(
        &self,
        dimensions: &[SelectedDimension],
        worst_deviation: f64,
        escalating_from: Option<IntensityTier>,
    ) -> IntensityTier {
        let ratio = worst_deviation / self.drift.threshold.max(f64::EPSILON);
        let computed = IntensityTier::from_ratio(ratio);
        match escalating_from {
            Some(previous) => computed.max(previous.stronger()).max(IntensityTier::Moderate),
            None => {
                let correcting = dimensions.iter().filter(|d| d.trend == Trend::Correcting).count();
                if correcting * 2 > dimensions.len() {
                    computed.softer()
                } else {
                    computed
                }
            }
        }
    }

    /// Mutate session state for `transition`. `text` is the generated
    /// correction for transitions that need one.
    pub fn apply(&self, state: &mut SessionState, transition: &Transition, text: Option<String>) -> InjectionChange {
        match transition {
            Transition::Disabled => {
                state.correction = None;
                state.recovery_cycles = 0;
                InjectionChange::Clear
            }
            Transition::Idle | Transition::NotRescored => InjectionChange::Keep,
            Transition::CooldownTick { remaining } => {
                state.cooldown_remaining = *remaining;
                InjectionChange::Keep
            }
            Transition::Open { selection } => self.open(state, selection, 1, text),
            Transition::Waiting { scores_since } => {
                if let Some(c) = state.correction.as_mut() {
                    c.scores_since_correction = *scores_since;
                }
                state.recovery_cycles = 0;
                InjectionChange::Keep
            }
            Transition::Recovering { confirmations } => {
                if let Some(c) = state.correction.as_mut() {
                    c.scores_since_correction += 1;
                }
                state.recovery_cycles = *confirmations;
                InjectionChange::Keep
            }
            Transition::Hold { reason, deviation } => {
                if let Some(c) = state.correction.as_mut() {
                    c.scores_since_correction = 0;
                    match reason {
                        HoldReason::Grace => c.grace_used = true,
                        HoldReason::Improving => {
                            c.deviation_at_injection = *deviation;
                            c.grace_used = false;
                        }
                        HoldReason::TrendCorrecting => {}
                    }
                }
                state.recovery_cycles = 0;
                InjectionChange::Keep
            }
            Transition::Escalate { selection, attempt } => self.open(state, selection, *attempt, text),
            Transition::Recover { dimension_ids, marker } => {
                state.correction = None;
                state.recovery_cycles = 0;
                state.cooldown_remaining = self.settings.cooldown;
                for id in dimension_ids {
                    if let Some(marker) = marker {
                        state.cusum_reset_markers.insert(id.clone(), *marker);
                    }
                    // A fresh reset marker wins over a fallback streak from this cycle.
                    state.fallback_streaks.insert(id.clone(), 0);
                }
                InjectionChange::Clear
            }
            Transition::Ceiling { dimension_ids, reopen } => {
                state.correction = None;
                state.recovery_cycles = 0;
                for id in dimension_ids {
                    state.ceiling_dimensions.insert(id.clone());
                    state.ever_ceilinged.insert(id.clone());
                    state.fallback_streaks.insert(id.clone(), 0);
                }
                match reopen {
                    Some(selection) => self.open(state, selection, 1, text),
                    None => InjectionChange::Clear,
                }
            }
        }
    }

    fn open(
        &self,
        state: &mut SessionState,
        selection: &Selection,
        attempt: u32,
        text: Option<String>,
    ) -> InjectionChange {
        let text = text.unwrap_or_else(|| fallback_correction_text(selection));
        state.correction = Some(ActiveCorrection {
            enabled: true,
            dimension_ids: selection.ids(),
            injection_text: text.clone(),
            since_message: state.last_message_id().unwrap_or(0),
            attempt,
            scores_since_correction: 0,
            deviation_at_injection: selection.deviation,
            tier: selection.tier,
            grace_used: false,
        });
        state.recovery_cycles = 0;
        state.corrections_injected += 1;
        state.ever_corrected.extend(selection.ids());
        InjectionChange::Set(text)
    }
}

/// Observed scores for `id` recorded after the correction took effect.
fn post_correction_scores(state: &SessionState, correction: &ActiveCorrection, id: &str) -> Vec<f64> {
    state
        .history
        .observed_values(id)
        .into_iter()
        .filter(|(msg, _)| *msg > correction.since_message)
        .map(|(_, v)| v)
        .collect()
}

fn target_of(report: &DriftReport, id: &str) -> Option<f64> {
    report.get(id).map(|d| d.target)
}

/// Worst `|mean(post-correction scores) - target|` over corrected dimensions.
pub fn post_correction_deviation(
    state: &SessionState,
    correction: &ActiveCorrection,
    report: &DriftReport,
) -> Option<f64> {
    correction
        .dimension_ids
        .iter()
        .filter_map(|id| {
            let target = target_of(report, id)?;
            let scores = post_correction_scores(state, correction, id);
            if scores.is_empty() {
                return None;
            }
            Some((crate::drift::mean(&scores) - target).abs())
        })
        .reduce(f64::max)
}

// ============ Injection text ============

fn label_for(id: &str, value: f64) -> String {
    match crate::dimensions::find_dimension(id) {
        Some(d) => {
            let level = (snap_to_discrete(value) * 4.0).round() as usize;
            format!("{} ({})", d.rubric[level.min(4)], if value >= 0.5 { d.high_label } else { d.low_label })
        }
        None => format!("{} at {:.2}", id, value),
    }
}

/// Template text used when correction generation fails.
pub fn fallback_correction_text(selection: &Selection) -> String {
    let lines: Vec<String> = selection
        .dimensions
        .iter()
        .map(|d| {
            let drifted = d
                .estimate
                .map(|e| format!(" Recent replies read as: {}.", label_for(&d.id, e)))
                .unwrap_or_default();
            format!("- {}: {}.{}", d.id, label_for(&d.id, d.target), drifted)
        })
        .collect();
    let lead = match selection.tier {
        IntensityTier::Subtle => "Stay true to the character's established voice:",
        IntensityTier::Moderate => "The character has been slipping. Return to:",
        IntensityTier::Strong => "IMPORTANT: the character has drifted badly out of voice. From the next reply on, write it as:",
    };
    format!("[{}\n{}]", lead, lines.join("\n"))
}

/// Compact profile anchor injected under the `baseline` key.
pub fn baseline_anchor_text(character_name: &str, dimensions: &[ActiveDimension]) -> String {
    let lines: Vec<String> = dimensions
        .iter()
        .map(|d| {
            let context = if d.context.trim().is_empty() {
                String::new()
            } else {
                format!(" - {}", d.context.trim())
            };
            format!("- {} {:.2} ({}){}", d.id, d.target, d.target_pole(), context)
        })
        .collect();
    format!("[{}'s core voice]\n{}", character_name, lines.join("\n"))
}

/// Inputs for one correction text.
pub struct CorrectionRequest<'a> {
    pub profile: &'a CharacterProfile,
    pub dimensions: &'a [ActiveDimension],
    pub selection: &'a Selection,
    pub attempt: u32,
    pub recent: &'a [Turn],
}

fn build_correction_messages(request: &CorrectionRequest<'_>) -> Vec<ChatMessage> {
    let CorrectionRequest {
        profile,
        dimensions,
        selection,
        attempt,
        recent,
    } = *request;
    let evidence = selection
        .dimensions
        .iter()
        .map(|d| {
            let context = dimensions
                .iter()
                .find(|a| a.id == d.id)
                .map(|a| a.context.as_str())
                .unwrap_or("");
            let catalog = crate::dimensions::find_dimension(&d.id);
            format!(
                "- {} (0 = {}, 1 = {}): target {:.2}, recent estimate {}, deviation {:.2}, trend {:?}. Context: {}",
                d.id,
                catalog.map(|c| c.low_label).unwrap_or("low"),
                catalog.map(|c| c.high_label).unwrap_or("high"),
                d.target,
                d.estimate.map(|e| format!("{:.2}", e)).unwrap_or_else(|| "n/a".into()),
                d.deviation,
                d.trend,
                if context.is_empty() { "none given" } else { context }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let conversation = recent
        .iter()
        .map(|t| format!("{}: {}", t.author.label(), t.text))
        .collect::<Vec<_>>()
        .join("\n");

    let system_prompt = format!(
        r#"You write short author's notes that steer a roleplay character back to their established personality. The note is inserted into the model's context just before it writes the next reply.

RULES:
- Address the behavior, not the model. Describe how {name} speaks and acts.
- Do not mention scores, drift, dimensions or corrections.
- Do not summarize the plot or dictate what happens next.
- At most 5 sentences.

INTENSITY: {guidance}
ATTEMPT: {attempt} (a higher attempt means earlier notes were ignored; be more concrete)

Reply with ONLY the note text."#,
        name = profile.name,
        guidance = selection.tier.guidance(),
        attempt = attempt,
    );

    let user_prompt = format!(
        "CHARACTER PROFILE:\n{}\n\nDRIFTING TRAITS:\n{}\n\nRECENT CONVERSATION:\n{}\n\nWrite the note:",
        profile.full_text(),
        evidence,
        conversation
    );

    vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)]
}

fn clean_generated_note(text: &str) -> Option<String> {
    let cleaned = text
        .trim()
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .trim_matches('"')
        .trim();
    if cleaned.is_empty() {
        return None;
    }
    let capped: String = cleaned.chars().take(MAX_CORRECTION_CHARS).collect();
    Some(format!("[{}]", capped.trim_start_matches('[').trim_end_matches(']')))
}

/// Ask the backend for correction text; the template is used on any failure.
pub async fn generate_correction_text(
    backend: &dyn AnalysisBackend,
    request: &CorrectionRequest<'_>,
    max_tokens: u32,
    chat_id: &str,
) -> String {
    let selection = request.selection;
    let messages = build_correction_messages(request);
    match analyze(backend, &messages, max_tokens, false).await {
        Ok(analysis) => match analysis.into_text().as_deref().and_then(clean_generated_note) {
            Some(note) => note,
            None => {
                logging::log_error(Some(chat_id), "Correction generation returned no text, using template");
                fallback_correction_text(selection)
            }
        },
        Err(e) => {
            logging::log_error(
                Some(chat_id),
                &format!("Correction generation failed, using template: {}", e),
            );
            fallback_correction_text(selection)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DimensionScore, ScoreEntry};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn controller() -> CorrectionController {
        CorrectionController::new(DriftSettings::default(), CorrectionSettings::default())
    }

    fn drift(id: &str, target: f64, deviation: f64, trend: Trend, correcting: bool) -> DimensionDrift {
        DimensionDrift {
            dimension_id: id.into(),
            target,
            estimate: Some((target - deviation).max(0.0)),
            uncertainty: Some(0.1),
            deviation: Some(deviation),
            trend,
            cusum: 0.0,
            cusum_threshold: 0.8,
            cusum_triggered: correcting,
            severe: false,
            fallback_triggered: false,
            correcting,
            sample_count: 8,
            ceilinged: false,
        }
    }

    fn report(dims: Vec<DimensionDrift>) -> DriftReport {
        DriftReport {
            dimensions: dims,
            computed_at: Utc::now(),
        }
    }

    fn push(state: &mut SessionState, id: usize, dim: &str, v: f64) {
        let mut scores = BTreeMap::new();
        scores.insert(dim.to_string(), DimensionScore::Observed(v));
        state.history.push(ScoreEntry::new(id, scores));
    }

    fn rescored(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// Open a warmth correction at target 0.8 after scores of 0.25.
    fn opened_state(c: &CorrectionController) -> SessionState {
        let mut state = SessionState::new("chat");
        push(&mut state, 0, "warmth", 0.25);
        push(&mut state, 1, "warmth", 0.25);
        let r = report(vec![drift("warmth", 0.8, 0.55, Trend::Stable, true)]);
        let t = c.decide(&state, &r, &rescored(&["warmth"]));
        assert!(matches!(t, Transition::Open { .. }));
        c.apply(&mut state, &t, Some("[be warm]".into()));
        state
    }

    #[test]
    fn tier_thresholds() {
        assert_eq!(IntensityTier::from_ratio(1.0), IntensityTier::Subtle);
        assert_eq!(IntensityTier::from_ratio(1.29), IntensityTier::Subtle);
        assert_eq!(IntensityTier::from_ratio(1.3), IntensityTier::Moderate);
        assert_eq!(IntensityTier::from_ratio(1.79), IntensityTier::Moderate);
        assert_eq!(IntensityTier::from_ratio(1.8), IntensityTier::Strong);
    }

    #[test]
    fn opens_on_worst_dimensions_up_to_max() {
        let c = controller();
        let state = SessionState::new("chat");
        let r = report(vec![
            drift("warmth", 0.8, 0.30, Trend::Stable, true),
            drift("humor", 0.4, 0.50, Trend::Stable, true),
            drift("formality", 0.6, 0.25, Trend::Stable, true),
            drift("verbosity", 0.7, 0.60, Trend::Stable, false),
        ]);
        let Transition::Open { selection } = c.decide(&state, &r, &BTreeSet::new()) else {
            panic!("expected open");
        };
        assert_eq!(selection.ids(), vec!["humor", "warmth"]);
        // 0.50 / 0.20 = 2.5
        assert_eq!(selection.tier, IntensityTier::Strong);
        assert_eq!(selection.deviation, 0.50);
    }

    #[test]
    fn majority_correcting_damps_tier() {
        let c = controller();
        let state = SessionState::new("chat");
        let r = report(vec![drift("warmth", 0.8, 0.30, Trend::Correcting, true)]);
        let Transition::Open { selection } = c.decide(&state, &r, &BTreeSet::new()) else {
            panic!("expected open");
        };
        // 0.30 / 0.20 = 1.5 is Moderate, damped to Subtle.
        assert_eq!(selection.tier, IntensityTier::Subtle);
    }

    #[test]
    fn ceilinged_and_quiet_dimensions_do_not_open() {
        let c = controller();
        let state = SessionState::new("chat");
        let mut ceilinged = drift("warmth", 0.8, 0.5, Trend::Stable, true);
        ceilinged.ceilinged = true;
        let r = report(vec![ceilinged, drift("humor", 0.4, 0.1, Trend::Stable, false)]);
        assert_eq!(c.decide(&state, &r, &BTreeSet::new()), Transition::Idle);
    }

    #[test]
    fn open_sets_record_and_counters() {
        let c = controller();
        let state = opened_state(&c);
        let record = state.correction.as_ref().unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.since_message, 1);
        assert_eq!(record.dimension_ids, vec!["warmth"]);
        assert_eq!(state.corrections_injected, 1);
        assert!(state.ever_corrected.contains("warmth"));
        assert_eq!(phase(&state), ControllerPhase::Active);
    }

    #[test]
    fn unrescored_cycles_do_not_count() {
        let c = controller();
        let state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.55, Trend::Stable, true)]);
        assert_eq!(c.decide(&state, &r, &rescored(&["humor"])), Transition::NotRescored);
    }

    #[test]
    fn recovers_after_patience_and_cools_down_exactly() {
        let c = controller();
        let mut state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.3, Trend::Correcting, true)]);

        push(&mut state, 2, "warmth", 0.75);
        let t = c.decide(&state, &r, &rescored(&["warmth"]));
        assert_eq!(t, Transition::Recovering { confirmations: 1 });
        assert_eq!(c.apply(&mut state, &t, None), InjectionChange::Keep);

        push(&mut state, 3, "warmth", 0.75);
        let t = c.decide(&state, &r, &rescored(&["warmth"]));
        assert!(matches!(t, Transition::Recover { marker: Some(3), .. }));
        state.fallback_streaks.insert("warmth".into(), 2);
        assert_eq!(c.apply(&mut state, &t, None), InjectionChange::Clear);
        assert!(state.correction.is_none());
        assert_eq!(state.cusum_reset_markers["warmth"], 3);
        assert_eq!(state.fallback_streaks["warmth"], 0);

        let drifting = report(vec![drift("warmth", 0.8, 0.55, Trend::Drifting, true)]);
        for expected in (0..5).rev() {
            assert_eq!(phase(&state), ControllerPhase::Cooldown);
            let t = c.decide(&state, &drifting, &rescored(&["warmth"]));
            assert_eq!(t, Transition::CooldownTick { remaining: expected });
            c.apply(&mut state, &t, None);
        }
        assert_eq!(phase(&state), ControllerPhase::Idle);
        assert!(matches!(
            c.decide(&state, &drifting, &rescored(&["warmth"])),
            Transition::Open { .. }
        ));
    }

    #[test]
    fn non_confirming_cycle_resets_recovery() {
        let c = controller();
        let mut state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.4, Trend::Stable, true)]);
        push(&mut state, 2, "warmth", 0.75);
        let t = c.decide(&state, &r, &rescored(&["warmth"]));
        c.apply(&mut state, &t, None);
        assert_eq!(state.recovery_cycles, 1);

        push(&mut state, 3, "warmth", 0.25);
        let t = c.decide(&state, &r, &rescored(&["warmth"]));
        assert_eq!(t, Transition::Waiting { scores_since: 2 });
        c.apply(&mut state, &t, None);
        assert_eq!(state.recovery_cycles, 0);
    }

    #[test]
    fn good_replies_do_not_recover_while_post_correction_mean_is_off() {
        let c = controller();
        let mut state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.4, Trend::Stable, true)]);
        let mut transitions = Vec::new();
        for (msg, v) in [(2, 0.25), (3, 0.25), (4, 0.25), (5, 0.75), (6, 0.75)] {
            push(&mut state, msg, "warmth", v);
            let t = c.decide(&state, &r, &rescored(&["warmth"]));
            c.apply(&mut state, &t, None);
            transitions.push(t);
        }
        // Post-correction mean is 0.45, deviation 0.35 against a 0.15 bound.
        assert_eq!(transitions[3], Transition::Waiting { scores_since: 1 });
        assert_eq!(transitions[4], Transition::Waiting { scores_since: 2 });
        assert!(state.correction.is_some());
        assert_eq!(state.recovery_cycles, 0);
        assert_eq!(state.cooldown_remaining, 0);
        let dev = post_correction_deviation(&state, state.correction.as_ref().unwrap(), &r).unwrap();
        assert!((dev - 0.35).abs() < 1e-9);
    }

    #[test]
    fn recovery_needs_every_corrected_dimension_rescored() {
        let c = controller();
        let mut state = SessionState::new("chat");
        let mut scores = BTreeMap::new();
        scores.insert("warmth".to_string(), DimensionScore::Observed(0.25));
        scores.insert("humor".to_string(), DimensionScore::Observed(1.0));
        state.history.push(ScoreEntry::new(0, scores.clone()));
        state.history.push(ScoreEntry::new(1, scores));
        let r = report(vec![
            drift("warmth", 0.8, 0.55, Trend::Stable, true),
            drift("humor", 0.4, 0.6, Trend::Stable, true),
        ]);
        let t = c.decide(&state, &r, &BTreeSet::new());
        c.apply(&mut state, &t, None);
        assert_eq!(state.correction.as_ref().unwrap().dimension_ids, vec!["humor", "warmth"]);

        push(&mut state, 2, "warmth", 0.75);
        assert_eq!(
            c.decide(&state, &r, &rescored(&["warmth"])),
            Transition::Waiting { scores_since: 1 }
        );
    }

    #[test]
    fn stagnation_gets_one_grace_then_escalates_then_ceilings() {
        let c = controller();
        let mut state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.55, Trend::Stable, true)]);
        let mut msg = 2;
        let mut feed = |state: &mut SessionState| {
            push(state, msg, "warmth", 0.25);
            msg += 1;
            let t = c.decide(state, &r, &rescored(&["warmth"]));
            c.apply(state, &t, Some("[note]".into()));
            t
        };

        // Attempt 1: two waits, then grace.
        assert!(matches!(feed(&mut state), Transition::Waiting { .. }));
        assert!(matches!(feed(&mut state), Transition::Waiting { .. }));
        assert!(matches!(feed(&mut state), Transition::Hold { reason: HoldReason::Grace, .. }));
        // Grace used: the next evaluation escalates.
        feed(&mut state);
        feed(&mut state);
        let t = feed(&mut state);
        let Transition::Escalate { selection, attempt } = t else {
            panic!("expected escalate, got {:?}", t);
        };
        assert_eq!(attempt, 2);
        assert!(selection.tier >= IntensityTier::Moderate);
        assert_eq!(state.correction.as_ref().unwrap().attempt, 2);
        assert_eq!(state.corrections_injected, 2);

        // Attempts 2 and 3 each get a grace and an escalation or ceiling.
        let mut last = Transition::Idle;
        for _ in 0..12 {
            last = feed(&mut state);
            if matches!(last, Transition::Ceiling { .. }) {
                break;
            }
        }
        assert!(matches!(last, Transition::Ceiling { reopen: None, .. }), "{:?}", last);
        assert!(state.ceiling_dimensions.contains("warmth"));
        assert!(state.ever_ceilinged.contains("warmth"));
        assert!(state.correction.is_none());
        assert_eq!(state.cooldown_remaining, 0);

        // Never re-attempted while ceilinged.
        let mut ceilinged = drift("warmth", 0.8, 0.55, Trend::Stable, true);
        ceilinged.ceilinged = true;
        let r = report(vec![ceilinged]);
        assert_eq!(c.decide(&state, &r, &rescored(&["warmth"])), Transition::Idle);
    }

    #[test]
    fn worsening_escalates_immediately_at_patience() {
        let c = controller();
        let mut state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.8, Trend::Drifting, true)]);
        for msg in 2..4 {
            push(&mut state, msg, "warmth", 0.0);
            let t = c.decide(&state, &r, &rescored(&["warmth"]));
            c.apply(&mut state, &t, None);
        }
        push(&mut state, 4, "warmth", 0.0);
        // Post-correction mean deviation 0.8 > 0.55 + 0.05.
        assert!(matches!(
            c.decide(&state, &r, &rescored(&["warmth"])),
            Transition::Escalate { attempt: 2, .. }
        ));
    }

    #[test]
    fn improvement_holds_and_rebases() {
        let c = controller();
        let mut state = opened_state(&c);
        let r = report(vec![drift("warmth", 0.8, 0.4, Trend::Stable, true)]);
        for msg in 2..5 {
            push(&mut state, msg, "warmth", 0.5);
            let t = c.decide(&state, &r, &rescored(&["warmth"]));
            c.apply(&mut state, &t, None);
            if msg == 4 {
                assert!(matches!(t, Transition::Hold { reason: HoldReason::Improving, .. }));
            }
        }
        let record = state.correction.as_ref().unwrap();
        assert!((record.deviation_at_injection - 0.3).abs() < 1e-9);
        assert_eq!(record.scores_since_correction, 0);
    }

    #[test]
    fn ceiling_reopens_for_other_drifting_dimension() {
        let mut settings = CorrectionSettings::default();
        settings.max_attempts = 1;
        let c = CorrectionController::new(DriftSettings::default(), settings);
        let mut state = opened_state(&c);
        state.correction.as_mut().unwrap().grace_used = true;
        let r = report(vec![
            drift("warmth", 0.8, 0.55, Trend::Stable, true),
            drift("humor", 0.4, 0.35, Trend::Stable, true),
        ]);
        let mut last = Transition::Idle;
        for msg in 2..5 {
            push(&mut state, msg, "warmth", 0.25);
            last = c.decide(&state, &r, &rescored(&["warmth"]));
            let text = last.text_request().map(|_| "[humor note]".to_string());
            c.apply(&mut state, &last, text);
        }
        let Transition::Ceiling { dimension_ids, reopen: Some(selection) } = last else {
            panic!("expected ceiling with reopen");
        };
        assert_eq!(dimension_ids, vec!["warmth"]);
        assert_eq!(selection.ids(), vec!["humor"]);
        let record = state.correction.as_ref().unwrap();
        assert_eq!(record.dimension_ids, vec!["humor"]);
        assert_eq!(record.injection_text, "[humor note]");
        assert_eq!(state.cooldown_remaining, 0);
    }

    #[test]
    fn ceiling_clears_when_back_within_threshold() {
        let c = controller();
        let mut state = SessionState::new("chat");
        state.ceiling_dimensions.insert("warmth".into());
        state.ceiling_dimensions.insert("humor".into());
        let mut warm = drift("warmth", 0.8, 0.15, Trend::Stable, false);
        warm.ceilinged = true;
        let mut humor = drift("humor", 0.4, 0.5, Trend::Stable, true);
        humor.ceilinged = true;
        let mut r = report(vec![warm, humor]);
        assert_eq!(c.clear_recovered_ceilings(&mut state, &mut r), vec!["warmth"]);
        assert!(!state.ceiling_dimensions.contains("warmth"));
        assert!(state.ceiling_dimensions.contains("humor"));
        assert!(!r.get("warmth").unwrap().ceilinged);
    }

    #[test]
    fn disabled_drops_active_record() {
        let mut settings = CorrectionSettings::default();
        let c = controller();
        let mut state = opened_state(&c);
        settings.enabled = false;
        let off = CorrectionController::new(DriftSettings::default(), settings);
        let r = report(vec![]);
        let t = off.decide(&state, &r, &BTreeSet::new());
        assert_eq!(t, Transition::Disabled);
        assert_eq!(off.apply(&mut state, &t, None), InjectionChange::Clear);
        assert_eq!(off.decide(&state, &r, &BTreeSet::new()), Transition::Idle);
    }

    #[test]
    fn injection_depth_is_clamped_to_half_the_chat() {
        let c = controller();
        assert_eq!(c.injection_depth(3), 1);
        assert_eq!(c.injection_depth(100), 4);
    }

    #[test]
    fn fallback_text_names_target_behavior() {
        let selection = Selection {
            dimensions: vec![SelectedDimension {
                id: "warmth".into(),
                target: 0.8,
                estimate: Some(0.25),
                deviation: 0.55,
                trend: Trend::Stable,
            }],
            tier: IntensityTier::Strong,
            deviation: 0.55,
        };
        let text = fallback_correction_text(&selection);
        assert!(text.starts_with("[IMPORTANT"));
        assert!(text.contains("warmth"));
        assert!(text.ends_with(']'));
    }

    #[test]
    fn baseline_anchor_lists_every_dimension() {
        let dims = vec![
            ActiveDimension::new("warmth", 0.8, "teases gently"),
            ActiveDimension::new("humor", 0.2, ""),
        ];
        let text = baseline_anchor_text("Mira", &dims);
        assert!(text.starts_with("[Mira's core voice]"));
        assert!(text.contains("warmth 0.80"));
        assert!(text.contains("teases gently"));
        assert!(text.contains("humor 0.20"));
    }

    #[test]
    fn generated_note_is_bracketed_and_capped() {
        assert_eq!(clean_generated_note("  \"Speak softly.\" ").unwrap(), "[Speak softly.]");
        assert!(clean_generated_note("   ").is_none());
        let long = "x".repeat(5000);
        assert!(clean_generated_note(&long).unwrap().chars().count() <= MAX_CORRECTION_CHARS + 2);
    }
}
