//! Per-chat scheduler
//!
//! A `Monitor` owns one chat's session state and runs the scoring and
//! correction cycle for it: calibrate, score the reply, append to history,
//! recompute drift, step the correction controller, update the host
//! injection, persist. Cycles are single-flight; requests that arrive while
//! one is running are deduplicated into a FIFO queue and drained afterwards.
//!
//! The `Supervisor` receives host events and keeps exactly one monitor alive
//! for the chat the host is showing. A chat switch closes the old monitor so
//! that any result still in flight is discarded instead of written into the
//! wrong session.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::AnalysisBackend;
use crate::calibration::{ensure_calibration, RecalibrationBackoff};
use crate::correction::{
    baseline_anchor_text, generate_correction_text, CorrectionController, CorrectionRequest, InjectionChange,
    Transition,
};
use crate::db::Store;
use crate::dimensions::ActiveDimension;
use crate::drift::DriftDetector;
use crate::error::{AnchorError, Result};
use crate::host::{
    ChatHost, CharacterProfile, HostEvent, InjectionPosition, InjectionRole, Turn, BASELINE_KEY, CORRECTION_KEY,
};
use crate::logging;
use crate::report::{build_report, generate_insights, SessionReport};
use crate::scoring::{conversation_window, score_response, track_unscored, ScoringRequest};
use crate::session::{DimensionScore, ScoreEntry, SessionState};
use crate::settings::Settings;

const HEALTH_TTL: Duration = Duration::from_secs(60);
const INSIGHTS_MAX_TOKENS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Monitoring is switched off in settings.
    Disabled,
    AlreadyScored,
    /// An equal or later message has already been scored.
    Superseded,
}

/// Result of one `score_and_process_message` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Scored {
        message_id: usize,
        scores: BTreeMap<String, DimensionScore>,
        transition: Transition,
        /// Dimensions that went unobservable for too long.
        warnings: Vec<String>,
    },
    Skipped {
        message_id: usize,
        reason: SkipReason,
    },
    /// Another cycle is running; this index will be processed after it.
    Queued {
        message_id: usize,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the busy flag for the duration of a cycle.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Monitor {
    chat_id: String,
    host: Arc<dyn ChatHost>,
    backend: Arc<dyn AnalysisBackend>,
    store: Arc<Store>,
    settings: Settings,
    closed: AtomicBool,
    busy: AtomicBool,
    queue: Mutex<VecDeque<usize>>,
    /// Locked for the whole cycle so read-modify-write is atomic across awaits.
    state: tokio::sync::Mutex<SessionState>,
    /// Last dimensions the baseline anchor was injected for.
    dimensions: Mutex<Option<Vec<ActiveDimension>>>,
    health: Mutex<Option<(bool, Instant)>>,
    recalibration: RecalibrationBackoff,
    detector: DriftDetector,
    controller: CorrectionController,
}

impl Monitor {
    pub fn open(
        chat_id: &str,
        host: Arc<dyn ChatHost>,
        backend: Arc<dyn AnalysisBackend>,
        store: Arc<Store>,
        settings: Settings,
    ) -> Result<Self> {
        let state = store.load_session(chat_id, settings.scoring.history_cap)?;
        logging::log_session(
            Some(chat_id),
            &format!(
                "Monitor opened ({} scored, {} corrections so far)",
                state.messages_scored, state.corrections_injected
            ),
        );
        Ok(Self {
            chat_id: chat_id.to_string(),
            host,
            backend,
            store,
            detector: DriftDetector::new(settings.drift.clone()),
            controller: CorrectionController::new(settings.drift.clone(), settings.correction.clone()),
            settings,
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            state: tokio::sync::Mutex::new(state),
            dimensions: Mutex::new(None),
            health: Mutex::new(None),
            recalibration: RecalibrationBackoff::default(),
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Stop accepting results; in-flight cycles end with `StaleChat`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.queue).clear();
    }

    fn is_stale(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.host.current_chat_id().as_deref() != Some(self.chat_id.as_str())
    }

    fn ensure_current(&self) -> Result<()> {
        if self.is_stale() {
            return Err(AnchorError::StaleChat(self.chat_id.clone()));
        }
        Ok(())
    }

    /// Indices waiting behind the in-flight cycle.
    pub fn pending(&self) -> Vec<usize> {
        lock(&self.queue).iter().copied().collect()
    }

    pub async fn session_snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    fn enqueue(&self, index: usize) {
        let mut queue = lock(&self.queue);
        if !queue.contains(&index) {
            queue.push_back(index);
        }
    }

    fn is_live_scorable(&self, index: usize) -> bool {
        !self.is_stale() && self.host.turn(index).is_some_and(|t| t.is_scorable())
    }

    /// Score one reply and step the correction controller.
    ///
    /// Idempotent per message unless `force` is set or the message was armed
    /// for re-scoring by a swipe.
    pub async fn score_and_process_message(&self, index: usize, force: bool) -> Result<CycleOutcome> {
        let Some(mut guard) = BusyGuard::acquire(&self.busy) else {
            self.enqueue(index);
            logging::log_scoring(Some(&self.chat_id), &format!("Message {} queued behind running cycle", index));
            return Ok(CycleOutcome::Queued { message_id: index });
        };

        let outcome = self.run_cycle(index, force).await;

        loop {
            loop {
                let next = lock(&self.queue).pop_front();
                let Some(next) = next else { break };
                if !self.is_live_scorable(next) {
                    continue;
                }
                if let Err(e) = self.run_cycle(next, false).await {
                    logging::log_error(Some(&self.chat_id), &format!("Queued message {} failed: {}", next, e));
                }
            }
            drop(guard);
            // Something may have been queued between the last pop and the release.
            if lock(&self.queue).is_empty() {
                break;
            }
            match BusyGuard::acquire(&self.busy) {
                Some(g) => guard = g,
                None => break,
            }
        }

        outcome
    }

    async fn run_cycle(&self, index: usize, force: bool) -> Result<CycleOutcome> {
        if !self.settings.enabled {
            return Ok(CycleOutcome::Skipped {
                message_id: index,
                reason: SkipReason::Disabled,
            });
        }
        self.ensure_current()?;
        let turns = self.host.turns();
        if !turns.iter().any(|t| t.index == index && t.is_scorable()) {
            return Err(AnchorError::NotScorable(index));
        }

        let mut state = self.state.lock().await;
        let armed = state.rescore_armed.contains(&index);
        if !force && !armed {
            if state.history.contains_message(index) {
                return Ok(CycleOutcome::Skipped {
                    message_id: index,
                    reason: SkipReason::AlreadyScored,
                });
            }
            if state.last_message_id().is_some_and(|last| index <= last) {
                return Ok(CycleOutcome::Skipped {
                    message_id: index,
                    reason: SkipReason::Superseded,
                });
            }
        }

        let result = self.process(&mut state, index, &turns).await;
        if let Err(e) = &result {
            logging::log_error(Some(&self.chat_id), &format!("Cycle for message {} failed: {}", index, e));
            // A stale result must not land in this chat's storage.
            if !matches!(e, AnchorError::StaleChat(_)) {
                state.touch();
                if let Err(save_err) = self.store.save_session(&state) {
                    logging::log_error(Some(&self.chat_id), &format!("Defensive save failed: {}", save_err));
                }
            }
        }
        result
    }

    async fn process(&self, state: &mut SessionState, index: usize, turns: &[Turn]) -> Result<CycleOutcome> {
        let profile = self.host.profile().ok_or(AnchorError::NoProfile)?;
        if let Some(model) = self.host.model_identity() {
            self.note_model(state, &model);
        }

        let dimensions = self.dimensions_for(&profile).await?;
        self.ensure_current()?;

        let Some(reply) = turns.iter().find(|t| t.index == index) else {
            return Err(AnchorError::NotScorable(index));
        };
        let window = conversation_window(
            turns,
            index,
            self.settings.scoring.context_turns,
            self.settings.scoring.max_turn_chars,
        );
        let request = ScoringRequest {
            response: &reply.text,
            profile: &profile,
            window: &window,
            dimensions: &dimensions,
            message_index: index,
        };
        let outcome = score_response(self.backend.as_ref(), &request, &self.settings.scoring, &self.chat_id).await?;
        self.ensure_current()?;

        state.rescore_armed.remove(&index);
        state.history.remove_message(index);
        state.history.push(ScoreEntry::new(index, outcome.scores.clone()));
        state.messages_scored += 1;

        let warnings = track_unscored(
            state,
            &dimensions,
            &outcome.scores,
            self.settings.scoring.unscored_warning_cycles,
        );
        for warning in &warnings {
            logging::log_scoring(Some(&self.chat_id), &format!("Warning: {}", warning));
        }

        let mut report = self.detector.analyze(state, &dimensions, true);
        let released = self.controller.clear_recovered_ceilings(state, &mut report);
        if !released.is_empty() {
            logging::log_correction(
                Some(&self.chat_id),
                &format!("Ceiling cleared after natural recovery: {}", released.join(", ")),
            );
        }

        let rescored: BTreeSet<String> = outcome
            .scores
            .iter()
            .filter(|(_, s)| s.observed().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        let transition = self.controller.decide(state, &report, &rescored);

        let text = match transition.text_request() {
            Some((selection, attempt)) => {
                let correction_request = CorrectionRequest {
                    profile: &profile,
                    dimensions: &dimensions,
                    selection,
                    attempt,
                    recent: &window,
                };
                let text = generate_correction_text(
                    self.backend.as_ref(),
                    &correction_request,
                    self.settings.correction.max_tokens,
                    &self.chat_id,
                )
                .await;
                self.ensure_current()?;
                Some(text)
            }
            None => None,
        };

        match self.controller.apply(state, &transition, text) {
            InjectionChange::Set(text) => self.host.set_injection(
                CORRECTION_KEY,
                &text,
                InjectionPosition::InChat,
                self.controller.injection_depth(turns.len()),
                InjectionRole::System,
            ),
            InjectionChange::Clear => self.host.clear_injection(CORRECTION_KEY),
            InjectionChange::Keep => {}
        }

        state.touch();
        self.store.save_session(state)?;

        match &transition {
            Transition::Idle | Transition::Waiting { .. } | Transition::NotRescored => logging::log_drift(
                Some(&self.chat_id),
                &format!("Message {}: {}", index, transition),
            ),
            _ => logging::log_correction(Some(&self.chat_id), &format!("Message {}: {}", index, transition)),
        }

        Ok(CycleOutcome::Scored {
            message_id: index,
            scores: outcome.scores,
            transition,
            warnings,
        })
    }

    /// Calibrated dimensions, re-injecting the baseline anchor when they change.
    async fn dimensions_for(&self, profile: &CharacterProfile) -> Result<Vec<ActiveDimension>> {
        let dimensions = ensure_calibration(
            &self.store,
            self.backend.as_ref(),
            &self.recalibration,
            profile,
            self.settings.scoring.calibration_max_tokens,
        )
        .await?;

        let changed = lock(&self.dimensions).as_ref() != Some(&dimensions);
        if changed {
            if self.settings.baseline_anchor {
                self.host.set_injection(
                    BASELINE_KEY,
                    &baseline_anchor_text(&profile.name, &dimensions),
                    InjectionPosition::BeforePrompt,
                    0,
                    InjectionRole::System,
                );
            }
            *lock(&self.dimensions) = Some(dimensions.clone());
        }
        Ok(dimensions)
    }

    /// Dimensions in use without calling the backend: the cache, else the
    /// stored calibration.
    fn known_dimensions(&self, profile: &CharacterProfile) -> Result<Vec<ActiveDimension>> {
        let cached = lock(&self.dimensions).clone();
        match cached {
            Some(dimensions) => Ok(dimensions),
            None => Ok(self
                .store
                .get_calibration(&profile.character_key())?
                .map(|c| c.dimensions)
                .unwrap_or_default()),
        }
    }

    fn note_model(&self, state: &mut SessionState, model: &str) {
        if state.observe_model(model) && !state.ceiling_dimensions.is_empty() {
            let cleared: Vec<String> = std::mem::take(&mut state.ceiling_dimensions).into_iter().collect();
            logging::log_correction(
                Some(&self.chat_id),
                &format!("Model changed to {}, ceilings cleared: {}", model, cleared.join(", ")),
            );
        }
    }

    /// Run (or reuse) calibration for the current character.
    pub async fn calibrate(&self) -> Result<Vec<ActiveDimension>> {
        let profile = self.host.profile().ok_or(AnchorError::NoProfile)?;
        let dimensions = self.dimensions_for(&profile).await?;
        self.ensure_current()?;
        Ok(dimensions)
    }

    /// Discard a regenerated turn's score and arm a one-shot re-score.
    /// Returns false when the turn had not been scored.
    pub async fn handle_swipe(&self, index: usize) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.history.remove_message(index).is_none() {
            return Ok(false);
        }
        let dimensions = self.known_dimensions(&self.host.profile().unwrap_or_default())?;
        self.detector.analyze(&mut state, &dimensions, false);
        state.rescore_armed.insert(index);
        state.touch();
        self.store.save_session(&state)?;
        logging::log_scoring(Some(&self.chat_id), &format!("Message {} swiped, re-score armed", index));
        Ok(true)
    }

    pub async fn handle_model_change(&self, model: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.note_model(&mut state, model);
        state.touch();
        self.store.save_session(&state)
    }

    /// Probe the backend, caching the answer for a minute.
    pub async fn backend_healthy(&self) -> bool {
        let cached = *lock(&self.health);
        if let Some((healthy, checked_at)) = cached {
            if checked_at.elapsed() < HEALTH_TTL {
                return healthy;
            }
        }
        let healthy = match self.backend.probe().await {
            Ok(()) => true,
            Err(e) => {
                logging::log_error(Some(&self.chat_id), &format!("Backend {} unhealthy: {}", self.backend.name(), e));
                false
            }
        };
        *lock(&self.health) = Some((healthy, Instant::now()));
        healthy
    }

    /// Build the session report, ask for insights and record it in the index.
    pub async fn generate_report(&self) -> Result<SessionReport> {
        let profile = self.host.profile().unwrap_or_default();
        let dimensions = self.known_dimensions(&profile)?;

        let state = self.state.lock().await.clone();
        let mut report = build_report(&state, &dimensions, &self.settings.drift, &profile.name);
        report.insights = generate_insights(self.backend.as_ref(), &report, INSIGHTS_MAX_TOKENS).await;
        self.store.record_report(&report.index_entry())?;
        logging::log_session(
            Some(&self.chat_id),
            &format!(
                "Report {}: resilience {:.1}, quality {:.1}, compatibility {:.1}",
                report.id, report.resilience, report.quality, report.compatibility
            ),
        );
        Ok(report)
    }
}

/// Routes host events to the monitor of the active chat.
pub struct Supervisor {
    host: Arc<dyn ChatHost>,
    backend: Arc<dyn AnalysisBackend>,
    store: Arc<Store>,
    settings: Settings,
    monitor: RwLock<Option<Arc<Monitor>>>,
}

impl Supervisor {
    pub fn new(
        host: Arc<dyn ChatHost>,
        backend: Arc<dyn AnalysisBackend>,
        store: Arc<Store>,
        settings: Settings,
    ) -> Result<Self> {
        let supervisor = Self {
            host,
            backend,
            store,
            settings,
            monitor: RwLock::new(None),
        };
        let current = supervisor.host.current_chat_id();
        supervisor.switch_chat(current.as_deref())?;
        Ok(supervisor)
    }

    pub fn monitor(&self) -> Option<Arc<Monitor>> {
        self.monitor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Tear down the current monitor and open one for `chat_id`.
    pub fn switch_chat(&self, chat_id: Option<&str>) -> Result<()> {
        let next = match chat_id {
            Some(id) => Some(Arc::new(Monitor::open(
                id,
                self.host.clone(),
                self.backend.clone(),
                self.store.clone(),
                self.settings.clone(),
            )?)),
            None => None,
        };
        let previous = std::mem::replace(
            &mut *self.monitor.write().unwrap_or_else(|poisoned| poisoned.into_inner()),
            next,
        );
        if let Some(previous) = previous {
            previous.close();
            logging::log_session(Some(previous.chat_id()), "Monitor closed");
        }
        Ok(())
    }

    /// Dispatch one event. Work is spawned; the handle is returned so callers
    /// can await it.
    pub fn handle_event(&self, event: HostEvent) -> Option<JoinHandle<()>> {
        if let HostEvent::ChatChanged { chat_id } = &event {
            if let Err(e) = self.switch_chat(chat_id.as_deref()) {
                logging::log_error(chat_id.as_deref(), &format!("Failed to open monitor: {}", e));
            }
            return None;
        }

        let monitor = self.monitor()?;
        let handle = match event {
            HostEvent::TurnRendered { index } => tokio::spawn(async move {
                match monitor.score_and_process_message(index, false).await {
                    Ok(_) | Err(AnchorError::StaleChat(_)) => {}
                    Err(e) => logging::log_error(Some(monitor.chat_id()), &format!("Message {}: {}", index, e)),
                }
            }),
            HostEvent::TurnSwiped { index } => tokio::spawn(async move {
                if let Err(e) = monitor.handle_swipe(index).await {
                    logging::log_error(Some(monitor.chat_id()), &format!("Swipe of {}: {}", index, e));
                }
            }),
            HostEvent::ModelChanged { model } => tokio::spawn(async move {
                if let Err(e) = monitor.handle_model_change(&model).await {
                    logging::log_error(Some(monitor.chat_id()), &format!("Model change: {}", e));
                }
            }),
            HostEvent::ChatChanged { .. } => return None,
        };
        Some(handle)
    }

    /// Consume events until the sender is dropped.
    pub async fn run(&self, mut events: mpsc::Receiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        if let Some(monitor) = self.monitor() {
            monitor.close();
        }
    }
}
