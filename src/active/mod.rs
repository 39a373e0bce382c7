//! Active learning controller
//!
//! After each converged posterior round, ranks candidate points by an
//! acquisition score over a pool built from posterior draws plus a
//! space-filling design, then hands the top of the ranking to the
//! simulator. Failed evaluations are replaced from the same ranking within
//! the same iteration, so a failure never inserts a placeholder and never
//! silently shrinks the batch.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sampler::{PosteriorModel, PosteriorTrace};
use crate::space::{design, ParameterSpace};
use crate::surrogate::{Surrogate, TrainingSet};
use crate::{CalibrationConfig, Result};

/// Acquisition strategy for choosing the next expensive evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acquisition {
    /// Maximize surrogate predictive variance (pure exploration)
    Uncertainty,
    /// Weight variance by posterior density, sharpening the surrogate where
    /// the likelihood is actually evaluated
    DensityTargeted,
}

/// Candidates ranked best-first. The session consumes the head of the
/// ranking and draws replacements from the tail when evaluations fail.
#[derive(Debug, Clone)]
pub struct CandidateRanking {
    ranked: Vec<Vec<f64>>,
}

impl CandidateRanking {
    /// Next candidate, best first.
    pub fn pop_best(&mut self) -> Option<Vec<f64>> {
        if self.ranked.is_empty() {
            None
        } else {
            Some(self.ranked.remove(0))
        }
    }

    /// Remaining candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    /// True when the ranking is exhausted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

/// Build the candidate pool and rank it by acquisition score.
///
/// The pool is the union of posterior draws and a fresh space-filling LHS
/// design. Within `acquisition_epsilon` (relative) of the top score,
/// candidates are re-ordered by greatest standardized distance to the
/// existing training inputs and to already-ranked candidates (diversity
/// tie-break).
///
/// # Errors
///
/// Propagates design-generation configuration errors.
pub fn rank_candidates(
    space: &ParameterSpace,
    surrogate: &Surrogate,
    model: &PosteriorModel,
    trace: &PosteriorTrace,
    training: &TrainingSet,
    config: &CalibrationConfig,
    rng: &mut StdRng,
) -> Result<CandidateRanking> {
    let mut pool: Vec<Vec<f64>> = Vec::with_capacity(2 * config.candidate_pool_size);

    // Posterior part of the pool: thinned draws.
    let n_posterior = config.candidate_pool_size.min(trace.samples.len());
    for _ in 0..n_posterior {
        let i = rng.gen_range(0..trace.samples.len());
        pool.push(trace.samples[i].theta.clone());
    }
    // Space-filling part.
    let lhs_n = config
        .candidate_pool_size
        .max(2.max(space.dim() + 1));
    pool.extend(design::latin_hypercube(
        space,
        lhs_n,
        config.strata_mode,
        rng,
    )?);

    // Acquisition scores.
    let log_density: Vec<f64> = match config.acquisition {
        Acquisition::Uncertainty => vec![0.0; pool.len()],
        Acquisition::DensityTargeted => pool
            .iter()
            .map(|theta| model.log_posterior(theta))
            .collect(),
    };
    let max_log_density = log_density
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let scores: Vec<f64> = pool
        .iter()
        .zip(&log_density)
        .map(|(theta, &ld)| {
            let variance = surrogate.mean_variance(theta);
            match config.acquisition {
                Acquisition::Uncertainty => variance,
                Acquisition::DensityTargeted => {
                    let weight = (ld - max_log_density).exp();
                    variance * weight
                }
            }
        })
        .collect();

    // Greedy ranking with the diversity tie-break. Anchors are the training
    // inputs plus everything ranked so far.
    let mut anchors: Vec<Vec<f64>> = training
        .points()
        .iter()
        .map(|p| p.theta().to_vec())
        .collect();
    let mut remaining: Vec<(Vec<f64>, f64)> = pool.into_iter().zip(scores).collect();
    let budget = (config.batch_size * 3).min(remaining.len());
    let mut ranked = Vec::with_capacity(budget);

    for _ in 0..budget {
        let top = remaining
            .iter()
            .map(|&(_, s)| s)
            .fold(f64::NEG_INFINITY, f64::max);
        if !top.is_finite() {
            break;
        }
        let cutoff = top - config.acquisition_epsilon * top.abs();
        let mut best_idx = 0;
        let mut best_dist = f64::NEG_INFINITY;
        for (i, (theta, score)) in remaining.iter().enumerate() {
            if *score < cutoff {
                continue;
            }
            let min_dist = anchors
                .iter()
                .map(|a| surrogate.standardized_distance(theta, a))
                .fold(f64::INFINITY, f64::min);
            if min_dist > best_dist {
                best_dist = min_dist;
                best_idx = i;
            }
        }
        let (theta, score) = remaining.swap_remove(best_idx);
        debug!(?score, distance = best_dist, "ranked candidate");
        anchors.push(theta.clone());
        ranked.push(theta);
    }

    Ok(CandidateRanking { ranked })
}

/// Tracks held-out surrogate quality between iterations and decides when
/// further expensive evaluations stop paying for themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CvTracker {
    previous_rmse: Option<f64>,
    consecutive_small: usize,
}

impl CvTracker {
    /// Fresh tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this iteration's LOO-CV RMSE; returns `true` when the
    /// relative improvement has stayed below `threshold` for two
    /// consecutive iterations.
    pub fn update(&mut self, rmse: f64, threshold: f64) -> bool {
        let small = match self.previous_rmse {
            None => false,
            Some(prev) if prev <= 0.0 => true,
            Some(prev) => (prev - rmse) / prev < threshold,
        };
        self.consecutive_small = if small {
            self.consecutive_small + 1
        } else {
            0
        };
        self.previous_rmse = Some(rmse);
        self.consecutive_small >= 2
    }
}
