//! Drift detection
//!
//! Per dimension, each scoring cycle:
//! - a scalar Kalman filter smooths the short window into an estimate and a
//!   95% confidence half-width,
//! - the short window is split in halves to classify the trend,
//! - a CUSUM over the long window (2x short) decides whether the deviation is
//!   persistent, with a tighter "severe" variant that fires faster,
//! - a moving-average fallback forces a trigger when the deviation stays over
//!   threshold for several cycles without CUSUM firing.
//!
//! CUSUM accumulates absolute deviation, so a character that swings above and
//! below its target builds evidence just like one drifting in one direction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimensions::ActiveDimension;
use crate::logging;
use crate::session::SessionState;
use crate::settings::DriftSettings;

pub const OBSERVATION_VARIANCE: f64 = 0.04;
pub const PROCESS_VARIANCE: f64 = 0.005;
pub const TREND_HYSTERESIS: f64 = 0.03;
pub const MIN_ALLOWANCE: f64 = 0.125;
pub const CUSUM_WINDOW_FACTOR: f64 = 0.8;
pub const SEVERE_WINDOW_FACTOR: f64 = 0.5;
pub const MIN_SCORES: usize = 2;

const Z_95: f64 = 1.96;

// ============ Kalman smoothing ============

/// Scalar random-walk Kalman filter.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    estimate: f64,
    variance: f64,
    initialized: bool,
    observation_variance: f64,
    process_variance: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(OBSERVATION_VARIANCE, PROCESS_VARIANCE)
    }
}

impl KalmanFilter {
    pub fn new(observation_variance: f64, process_variance: f64) -> Self {
        Self {
            estimate: 0.0,
            variance: observation_variance,
            initialized: false,
            observation_variance,
            process_variance,
        }
    }

    /// Fold in one observation. The first observation seeds the state.
    pub fn update(&mut self, observation: f64) {
        if !self.initialized {
            self.estimate = observation;
            self.variance = self.observation_variance;
            self.initialized = true;
            return;
        }
        let predicted = self.variance + self.process_variance;
        let gain = predicted / (predicted + self.observation_variance);
        self.estimate += gain * (observation - self.estimate);
        self.variance = (1.0 - gain) * predicted;
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// 95% confidence half-width.
    pub fn uncertainty(&self) -> f64 {
        Z_95 * self.variance.sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothed {
    pub estimate: f64,
    pub uncertainty: f64,
    /// True when the filter degenerated and the plain mean was used.
    pub fell_back: bool,
}

/// Smooth a window of scores. `None` for an empty window.
pub fn smooth(values: &[f64]) -> Option<Smoothed> {
    if values.is_empty() {
        return None;
    }
    let mut filter = KalmanFilter::default();
    for &v in values {
        filter.update(v);
    }
    let (estimate, uncertainty) = (filter.estimate(), filter.uncertainty());
    if estimate.is_finite() && uncertainty.is_finite() {
        return Some(Smoothed {
            estimate,
            uncertainty,
            fell_back: false,
        });
    }

    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    let n = finite.len() as f64;
    Some(Smoothed {
        estimate: mean(&finite),
        uncertainty: Z_95 * (OBSERVATION_VARIANCE / n).sqrt(),
        fell_back: true,
    })
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ============ Trend ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Drifting,
    Correcting,
    Stable,
    InsufficientData,
}

/// Compare mean deviation of the first and second half of the window.
/// The first half takes the extra element on odd lengths.
pub fn classify_trend(values: &[f64], target: f64) -> Trend {
    if values.len() < MIN_SCORES {
        return Trend::InsufficientData;
    }
    let deviations: Vec<f64> = values.iter().map(|v| (v - target).abs()).collect();
    let split = deviations.len().div_ceil(2);
    let delta = mean(&deviations[split..]) - mean(&deviations[..split]);
    if delta > TREND_HYSTERESIS {
        Trend::Drifting
    } else if delta < -TREND_HYSTERESIS {
        Trend::Correcting
    } else {
        Trend::Stable
    }
}

// ============ CUSUM ============

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CusumParams {
    pub allowance: f64,
    pub decision_threshold: f64,
}

/// Inflates decision thresholds as more dimensions are tested at once.
pub fn multiple_comparisons_factor(active_dimensions: usize) -> f64 {
    ((active_dimensions.max(1) + 1) as f64).log2().sqrt()
}

impl CusumParams {
    pub fn ordinary(threshold: f64, window: usize, active_dimensions: usize) -> Self {
        Self::derive(threshold, window, CUSUM_WINDOW_FACTOR, active_dimensions)
    }

    pub fn severe(alert_threshold: f64, window: usize, active_dimensions: usize) -> Self {
        Self::derive(alert_threshold, window, SEVERE_WINDOW_FACTOR, active_dimensions)
    }

    fn derive(threshold: f64, window: usize, window_factor: f64, active_dimensions: usize) -> Self {
        let allowance = (threshold / 2.0).max(MIN_ALLOWANCE);
        let decision_threshold = allowance
            * window as f64
            * window_factor
            * multiple_comparisons_factor(active_dimensions);
        Self {
            allowance,
            decision_threshold,
        }
    }
}

/// Running accumulator values, one per sample.
pub fn cusum_path(values: &[f64], target: f64, allowance: f64) -> Vec<f64> {
    let mut sum = 0.0_f64;
    values
        .iter()
        .map(|v| {
            sum = (sum + ((v - target).abs() - allowance)).max(0.0);
            sum
        })
        .collect()
}

/// Final accumulator value over the window.
pub fn cusum(values: &[f64], target: f64, allowance: f64) -> f64 {
    cusum_path(values, target, allowance).last().copied().unwrap_or(0.0)
}

// ============ Drift state ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDrift {
    pub dimension_id: String,
    pub target: f64,
    pub estimate: Option<f64>,
    pub uncertainty: Option<f64>,
    pub deviation: Option<f64>,
    pub trend: Trend,
    pub cusum: f64,
    pub cusum_threshold: f64,
    pub cusum_triggered: bool,
    pub severe: bool,
    pub fallback_triggered: bool,
    /// Any trigger fired: this dimension wants correction.
    pub correcting: bool,
    pub sample_count: usize,
    pub ceilinged: bool,
}

impl DimensionDrift {
    pub fn insufficient_data(&self) -> bool {
        self.sample_count < MIN_SCORES
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub dimensions: Vec<DimensionDrift>,
    pub computed_at: DateTime<Utc>,
}

impl DriftReport {
    pub fn get(&self, dimension_id: &str) -> Option<&DimensionDrift> {
        self.dimensions.iter().find(|d| d.dimension_id == dimension_id)
    }

    /// Dimensions eligible to open a correction: triggered, enough data,
    /// not ceilinged.
    pub fn correctable(&self) -> impl Iterator<Item = &DimensionDrift> + '_ {
        self.dimensions
            .iter()
            .filter(|d| d.correcting && !d.ceilinged && !d.insufficient_data())
    }
}

pub struct DriftDetector {
    settings: DriftSettings,
}

impl DriftDetector {
    pub fn new(settings: DriftSettings) -> Self {
        Self { settings }
    }

    /// Recompute drift for every active dimension.
    ///
    /// `advance_counters` is true for a real scoring cycle; recomputes after a
    /// swipe pass false so the fallback streaks and trigger sets stay put.
    pub fn analyze(
        &self,
        state: &mut SessionState,
        dimensions: &[ActiveDimension],
        advance_counters: bool,
    ) -> DriftReport {
        let window = self.settings.window.max(MIN_SCORES);
        let ordinary = CusumParams::ordinary(self.settings.threshold, window, dimensions.len());
        let severe = CusumParams::severe(self.settings.alert_threshold, window, dimensions.len());

        let report = DriftReport {
            dimensions: dimensions
                .iter()
                .map(|dim| self.analyze_dimension(state, dim, window, ordinary, severe, advance_counters))
                .collect(),
            computed_at: Utc::now(),
        };
        state.last_drift = Some(report.clone());
        report
    }

    fn analyze_dimension(
        &self,
        state: &mut SessionState,
        dim: &ActiveDimension,
        window: usize,
        ordinary: CusumParams,
        severe_params: CusumParams,
        advance_counters: bool,
    ) -> DimensionDrift {
        let id = dim.id.as_str();
        let ceilinged = state.ceiling_dimensions.contains(id);
        let observed = state.history.observed_values(id);

        let short: Vec<f64> = tail(&observed, window).iter().map(|(_, v)| *v).collect();
        let marker = state.cusum_reset_markers.get(id).copied();
        let long: Vec<f64> = tail(&observed, window * 2)
            .iter()
            .filter(|(msg, _)| marker.map_or(true, |m| *msg > m))
            .map(|(_, v)| *v)
            .collect();

        let mut drift = DimensionDrift {
            dimension_id: dim.id.clone(),
            target: dim.target,
            estimate: None,
            uncertainty: None,
            deviation: None,
            trend: Trend::InsufficientData,
            cusum: 0.0,
            cusum_threshold: ordinary.decision_threshold,
            cusum_triggered: false,
            severe: false,
            fallback_triggered: false,
            correcting: false,
            sample_count: short.len(),
            ceilinged,
        };

        if short.len() < MIN_SCORES {
            return drift;
        }

        if let Some(smoothed) = smooth(&short) {
            if smoothed.fell_back {
                logging::log_drift(
                    Some(&state.chat_id),
                    &format!("Kalman degenerated for {}, using mean {:.3}", id, smoothed.estimate),
                );
            }
            drift.estimate = Some(smoothed.estimate);
            drift.uncertainty = Some(smoothed.uncertainty);
            drift.deviation = Some((smoothed.estimate - dim.target).abs());
        }
        drift.trend = classify_trend(&short, dim.target);

        if long.len() >= MIN_SCORES {
            let value = cusum(&long, dim.target, ordinary.allowance);
            let severe_value = cusum(&long, dim.target, severe_params.allowance);
            if value.is_finite() && severe_value.is_finite() {
                drift.cusum = value;
                drift.cusum_triggered = value >= ordinary.decision_threshold;
                drift.severe = severe_value >= severe_params.decision_threshold;
            } else {
                logging::log_drift(
                    Some(&state.chat_id),
                    &format!("CUSUM for {} was not finite; trigger suppressed", id),
                );
            }
        }

        let deviation = drift.deviation.unwrap_or(0.0);
        let cusum_fired = drift.cusum_triggered || drift.severe;
        if advance_counters {
            let streak = state.fallback_streaks.entry(dim.id.clone()).or_insert(0);
            if ceilinged || cusum_fired || deviation <= self.settings.threshold {
                *streak = 0;
            } else {
                *streak += 1;
            }
        }
        let streak = state.fallback_streaks.get(id).copied().unwrap_or(0);
        drift.fallback_triggered =
            !cusum_fired && !ceilinged && streak >= self.settings.fallback_cycles;
        drift.correcting = cusum_fired || drift.fallback_triggered;

        if advance_counters {
            if cusum_fired {
                state.cusum_triggered.insert(dim.id.clone());
            }
            if drift.fallback_triggered {
                state.fallback_triggered.insert(dim.id.clone());
            }
        }

        drift
    }
}

fn tail<T>(values: &[T], n: usize) -> &[T] {
    &values[values.len().saturating_sub(n)..]
}
