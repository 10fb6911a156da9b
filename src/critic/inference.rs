//! Deterministic score inference
//!
//! Pure kernel mapping blind pairwise judgments onto the 1-10 scale.
//! Each judgment becomes a target probability that the story beats the
//! anchor; the inferred score minimizes weighted binary cross-entropy
//! against the logistic link `p_i(S) = sigma((S - score10_i) / tau)`
//! over a fixed grid. No randomness, no state: identical inputs give
//! bit-identical outputs within one grid step.

use crate::error::{EngineError, Result};
use crate::types::AnchorSummary;

/// Profile-loss delta bounding the reported interval (chi-square(1)/2
/// at 95%).
const CI_LOSS_DELTA: f64 = 1.92;

const SCORE_MIN: f64 = 1.0;
const SCORE_MAX: f64 = 10.0;

/// One judged anchor ready for inference.
#[derive(Debug, Clone)]
pub struct JudgedAnchor {
    pub anchor: AnchorSummary,
    /// Target probability: better = 1.0, tie = 0.5, worse = 0.0
    pub target: f64,
    /// Strength weight: weak = 1, medium = 2, strong = 3
    pub strength_weight: f64,
}

impl JudgedAnchor {
    fn weight(&self) -> f64 {
        self.anchor.weight * self.strength_weight
    }
}

/// Everything the audit records about one role's inference.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InferenceResult {
    pub score: f64,
    /// Total weighted BCE at the optimum
    pub loss: f64,
    /// Loss per unit weight; the densification trigger compares this
    pub normalized_loss: f64,
    pub avg_strength: f64,
    pub monotonic_violations: usize,
    pub ci_low: f64,
    pub ci_high: f64,
    pub tau: f64,
}

/// Minimize weighted BCE over the score grid.
pub fn infer_score(judged: &[JudgedAnchor], tau: f64, grid_step: f64) -> Result<InferenceResult> {
    if judged.is_empty() {
        return Err(EngineError::Config(
            "score inference requires at least one judged anchor".into(),
        ));
    }
    if tau <= 0.0 {
        return Err(EngineError::Config(format!(
            "tau must be positive, got {}",
            tau
        )));
    }

    let total_weight: f64 = judged.iter().map(|j| j.weight()).sum();
    if total_weight <= 0.0 {
        return Err(EngineError::Config(
            "score inference requires positive anchor weights".into(),
        ));
    }

    let steps = ((SCORE_MAX - SCORE_MIN) / grid_step).round() as usize;
    let mut best_score = SCORE_MIN;
    let mut best_loss = f64::INFINITY;

    // First minimum wins, so ties resolve toward the lower score and the
    // argmin is reproducible.
    for i in 0..=steps {
        let s = SCORE_MIN + i as f64 * grid_step;
        let loss = weighted_loss(judged, s, tau);
        if loss < best_loss {
            best_loss = loss;
            best_score = s;
        }
    }

    // Profile interval: the grid range where loss stays within the delta.
    let mut ci_low = best_score;
    let mut ci_high = best_score;
    for i in 0..=steps {
        let s = SCORE_MIN + i as f64 * grid_step;
        if weighted_loss(judged, s, tau) <= best_loss + CI_LOSS_DELTA {
            if s < ci_low {
                ci_low = s;
            }
            if s > ci_high {
                ci_high = s;
            }
        }
    }

    let avg_strength =
        judged.iter().map(|j| j.strength_weight).sum::<f64>() / judged.len() as f64;

    Ok(InferenceResult {
        score: best_score,
        loss: best_loss,
        normalized_loss: best_loss / total_weight,
        avg_strength,
        monotonic_violations: monotonic_violations(judged),
        ci_low,
        ci_high,
        tau,
    })
}

fn weighted_loss(judged: &[JudgedAnchor], s: f64, tau: f64) -> f64 {
    judged
        .iter()
        .map(|j| j.weight() * bce(j.target, sigmoid((s - j.anchor.score10) / tau)))
        .sum()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn bce(target: f64, p: f64) -> f64 {
    let p = p.clamp(1e-9, 1.0 - 1e-9);
    -(target * p.ln() + (1.0 - target) * (1.0 - p).ln())
}

/// Pairs judged against the score gradient: a strictly weaker anchor
/// drew a strictly less favorable judgment than a stronger one.
fn monotonic_violations(judged: &[JudgedAnchor]) -> usize {
    let mut count = 0;
    for i in 0..judged.len() {
        for j in (i + 1)..judged.len() {
            let (a, b) = (&judged[i], &judged[j]);
            let (low, high) = if a.anchor.score10 < b.anchor.score10 {
                (a, b)
            } else if b.anchor.score10 < a.anchor.score10 {
                (b, a)
            } else {
                continue;
            };
            // The story should fare at least as well against the weaker
            // anchor as against the stronger one.
            if low.target < high.target {
                count += 1;
            }
        }
    }
    count
}
