//! Convergence detection across optimization rounds.
//!
//! Watches hypervolume gain rate, best-candidate improvement, frontier
//! stability, QD novelty, and return on evaluation spend. EWMA smoothing
//! plus a hysteresis window keep a single noisy round from ending a run.

use std::collections::BTreeSet;

use kaizen_core::Fingerprint;

#[derive(Clone, Debug)]
pub struct EpochMetrics {
    pub round: u64,
    pub hypervolume: f64,
    pub new_evaluations: u64,
    pub best_quality: f64,
    pub best_cost: f64,
    pub frontier: BTreeSet<Fingerprint>,
    /// Fraction of this round's archived candidates that opened a new QD
    /// cell.
    pub qd_novelty_rate: f64,
    /// Cumulative task-oracle token spend; ROI is hypervolume gained per
    /// token of its per-epoch delta.
    pub total_tokens_spent: u64,
}

#[derive(Clone, Debug)]
pub struct GovernorConfig {
    pub alpha: f64,
    pub hysteresis_window: u32,
    pub stop_threshold: f64,
    pub tau_hv: f64,
    pub tau_quality: f64,
    pub tau_quality_relative: f64,
    pub tau_cost: f64,
    pub tau_qd_novelty: f64,
    pub tau_roi: f64,
    pub min_jaccard_for_stable: f64,
    pub weight_hv: f64,
    pub weight_quality: f64,
    pub weight_cost: f64,
    pub weight_qd: f64,
    pub weight_roi: f64,
    pub stability_penalty_beta: f64,
    pub max_no_improvement_epochs: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            hysteresis_window: 5,
            stop_threshold: 0.15,
            tau_hv: 1e-5,
            tau_quality: 1e-3,
            tau_quality_relative: 0.01,
            tau_cost: 5.0,
            tau_qd_novelty: 0.03,
            tau_roi: 1e-6,
            min_jaccard_for_stable: 0.85,
            weight_hv: 1.0,
            weight_quality: 1.0,
            weight_cost: 0.6,
            weight_qd: 0.7,
            weight_roi: 0.5,
            stability_penalty_beta: 0.5,
            max_no_improvement_epochs: 12,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StopDecision {
    pub stop: bool,
    pub score: f64,
    pub reason: Option<String>,
}

pub struct StopGovernor {
    config: GovernorConfig,
    epochs_seen: u32,
    prev: Option<EpochMetrics>,
    ewma_hv_rate: f64,
    ewma_quality_delta: f64,
    ewma_cost_delta: f64,
    ewma_roi: f64,
    last_novelty_rate: f64,
    last_jaccard: f64,
    last_best_quality: f64,
    epochs_below_threshold: u32,
    epochs_no_improvement: u32,
}

impl StopGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            epochs_seen: 0,
            prev: None,
            ewma_hv_rate: 0.0,
            ewma_quality_delta: 0.0,
            ewma_cost_delta: 0.0,
            ewma_roi: 0.0,
            last_novelty_rate: 0.0,
            last_jaccard: 0.0,
            last_best_quality: 0.0,
            epochs_below_threshold: 0,
            epochs_no_improvement: 0,
        }
    }

    pub fn update(&mut self, metrics: EpochMetrics) {
        self.epochs_seen += 1;
        if let Some(prev) = &self.prev {
            let delta_hv = metrics.hypervolume - prev.hypervolume;
            let hv_rate = delta_hv / metrics.new_evaluations.max(1) as f64;
            let delta_quality = metrics.best_quality - prev.best_quality;
            let delta_cost = metrics.best_cost - prev.best_cost;
            let token_delta = metrics
                .total_tokens_spent
                .saturating_sub(prev.total_tokens_spent);
            let roi = delta_hv / token_delta.max(1) as f64;

            let alpha = self.config.alpha;
            self.ewma_hv_rate = alpha * hv_rate + (1.0 - alpha) * self.ewma_hv_rate;
            self.ewma_quality_delta = alpha * delta_quality + (1.0 - alpha) * self.ewma_quality_delta;
            self.ewma_cost_delta = alpha * delta_cost + (1.0 - alpha) * self.ewma_cost_delta;
            self.ewma_roi = alpha * roi + (1.0 - alpha) * self.ewma_roi;

            if delta_quality > self.config.tau_quality {
                self.epochs_no_improvement = 0;
            } else {
                self.epochs_no_improvement += 1;
            }
            self.last_jaccard = jaccard(&prev.frontier, &metrics.frontier);
        }
        self.last_novelty_rate = metrics.qd_novelty_rate;
        self.last_best_quality = metrics.best_quality;
        self.prev = Some(metrics);
    }

    /// Per-signal strengths in [0, 1]; 1 means the signal still shows
    /// useful progress.
    fn signals(&self) -> (f64, f64, f64, f64, f64, f64) {
        if self.epochs_seen < 2 {
            return (1.0, 1.0, 1.0, 1.0, 1.0, 0.0);
        }
        let c = &self.config;
        let s_hv = (self.ewma_hv_rate / c.tau_hv).clamp(0.0, 1.0);
        let absolute = self.ewma_quality_delta / c.tau_quality;
        let relative =
            (self.ewma_quality_delta / self.last_best_quality.max(0.01)) / c.tau_quality_relative;
        let s_quality = absolute.max(relative).clamp(0.0, 1.0);
        let s_cost = (self.ewma_cost_delta / c.tau_cost).clamp(0.0, 1.0);
        let s_qd = (self.last_novelty_rate / c.tau_qd_novelty).clamp(0.0, 1.0);
        let s_roi = (self.ewma_roi / c.tau_roi).clamp(0.0, 1.0);
        let s_stability = if self.last_jaccard > c.min_jaccard_for_stable {
            self.last_jaccard
        } else {
            0.0
        };
        (s_hv, s_quality, s_cost, s_qd, s_roi, s_stability)
    }

    /// Overall continuation score: the strongest weighted signal, discounted
    /// when the frontier has gone stable.
    pub fn stop_score(&self) -> f64 {
        let (s_hv, s_quality, s_cost, s_qd, s_roi, s_stability) = self.signals();
        let c = &self.config;
        let max_signal = (c.weight_hv * s_hv)
            .max(c.weight_quality * s_quality)
            .max(c.weight_cost * s_cost)
            .max(c.weight_qd * s_qd)
            .max(c.weight_roi * s_roi);
        let stability_penalty = (1.0 - s_stability).powf(c.stability_penalty_beta);
        max_signal * stability_penalty
    }

    pub fn should_stop(&mut self) -> StopDecision {
        if self.epochs_seen < 2 {
            return StopDecision {
                stop: false,
                score: 1.0,
                reason: None,
            };
        }
        let score = self.stop_score();
        if score < self.config.stop_threshold {
            self.epochs_below_threshold += 1;
        } else {
            self.epochs_below_threshold = 0;
        }

        if self.epochs_no_improvement >= self.config.max_no_improvement_epochs {
            return StopDecision {
                stop: true,
                score,
                reason: Some(format!(
                    "no quality improvement for {} epochs",
                    self.epochs_no_improvement
                )),
            };
        }
        if self.epochs_below_threshold >= self.config.hysteresis_window {
            return StopDecision {
                stop: true,
                score,
                reason: Some(format!(
                    "stop score below {} for {} epochs",
                    self.config.stop_threshold, self.epochs_below_threshold
                )),
            };
        }
        StopDecision {
            stop: false,
            score,
            reason: None,
        }
    }
}

pub fn jaccard(left: &BTreeSet<Fingerprint>, right: &BTreeSet<Fingerprint>) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count() as f64;
    let union = left.union(right).count() as f64;
    intersection / union
}

/// Hypervolume dominated by a (quality, neg_cost) frontier, both axes
/// maximized, relative to a lower-left reference point.
pub fn compute_hypervolume_2d(points: &[(f64, f64)], reference: (f64, f64)) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mut frontier: Vec<(f64, f64)> = Vec::new();
    for &(q, c) in points {
        let dominated = frontier
            .iter()
            .any(|&(fq, fc)| fq >= q && fc >= c && (fq > q || fc > c));
        if dominated {
            continue;
        }
        frontier.retain(|&(fq, fc)| !(q >= fq && c >= fc && (q > fq || c > fc)));
        frontier.push((q, c));
    }
    frontier.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let (ref_q, ref_c) = reference;
    let mut hypervolume = 0.0;
    let mut prev_c = ref_c;
    for (q, c) in frontier {
        if q > ref_q && c > prev_c {
            hypervolume += (q - ref_q) * (c - prev_c);
            prev_c = c;
        }
    }
    hypervolume
}
