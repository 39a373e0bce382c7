//! Calibration run configuration
//!
//! One flat, serializable struct validated once at construction. Defaults
//! follow ASHRAE Guideline 14 for the compliance thresholds and common
//! practice for the MCMC diagnostics (R-hat < 1.01, ESS > 400).

use serde::{Deserialize, Serialize};

use crate::active::Acquisition;
use crate::space::design::StrataMode;
use crate::{Error, Result};

/// Tunable knobs for a calibration session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Initial space-filling design size (must be >= max(2, dim + 1))
    pub initial_design_size: usize,
    /// Stratification mode for the Latin hypercube design
    pub strata_mode: StrataMode,
    /// Hard cap on cumulative expensive simulator evaluations
    pub evaluation_budget: usize,
    /// Candidates accepted per active-learning iteration
    pub batch_size: usize,
    /// Maximum active-learning iterations
    pub max_iterations: usize,
    /// Acquisition strategy for new candidates
    pub acquisition: Acquisition,
    /// Candidates within this fraction of the top acquisition score
    /// participate in the diversity tie-break
    pub acquisition_epsilon: f64,
    /// Size of the space-filling part of the candidate pool
    pub candidate_pool_size: usize,

    /// Independent MCMC chains (>= 2)
    pub chains: usize,
    /// Tuning draws per chain, discarded from the final trace
    pub tuning_draws: usize,
    /// Retained draws per chain
    pub sampling_draws: usize,
    /// Tuning-phase multiplier applied on the single convergence retry
    pub retry_tuning_multiplier: usize,
    /// Per-parameter R-hat threshold
    pub r_hat_threshold: f64,
    /// Per-parameter effective-sample-size floor
    pub ess_threshold: f64,
    /// Divergent transitions tolerated per round
    pub divergence_tolerance: usize,

    /// |MBE| acceptance threshold, percent
    pub mbe_threshold_pct: f64,
    /// Relaxed secondary |MBE| tier, percent
    pub mbe_relaxed_pct: f64,
    /// CV(RMSE) acceptance threshold, percent
    pub cv_rmse_threshold_pct: f64,
    /// Per-period absolute percentage error above which the period is
    /// flagged individually in the compliance report
    pub period_flag_threshold_pct: f64,
    /// Posterior draws used for the validation run (1 = posterior mean only)
    pub validation_draws: usize,

    /// Fraction of a batch allowed to fail before the session aborts
    pub max_batch_failure_fraction: f64,
    /// Simulator worker-pool concurrency cap
    pub simulator_concurrency: usize,
    /// Per-call simulator timeout, milliseconds
    pub simulator_timeout_ms: u64,

    /// Stop when held-out LOO-CV RMSE improves by less than this relative
    /// fraction for two consecutive iterations
    pub cv_improvement_threshold: f64,

    /// RNG seed for designs, chains, and candidate pools
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            initial_design_size: 12,
            strata_mode: StrataMode::EqualProbability,
            evaluation_budget: 60,
            batch_size: 4,
            max_iterations: 10,
            acquisition: Acquisition::DensityTargeted,
            acquisition_epsilon: 0.05,
            candidate_pool_size: 256,
            chains: 4,
            tuning_draws: 500,
            sampling_draws: 1000,
            retry_tuning_multiplier: 3,
            r_hat_threshold: 1.01,
            ess_threshold: 400.0,
            divergence_tolerance: 0,
            mbe_threshold_pct: 5.0,
            mbe_relaxed_pct: 10.0,
            cv_rmse_threshold_pct: 15.0,
            period_flag_threshold_pct: 50.0,
            validation_draws: 1,
            max_batch_failure_fraction: 0.5,
            simulator_concurrency: 4,
            simulator_timeout_ms: 600_000,
            cv_improvement_threshold: 0.01,
            seed: 42,
        }
    }
}

impl CalibrationConfig {
    /// Validate cross-field constraints once, before any expensive work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on any invalid knob.
    pub fn validate(&self) -> Result<()> {
        if self.chains < 2 {
            return Err(Error::Configuration(format!(
                "at least 2 chains required for R-hat, got {}",
                self.chains
            )));
        }
        if self.sampling_draws == 0 || self.tuning_draws == 0 {
            return Err(Error::Configuration(
                "tuning_draws and sampling_draws must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.simulator_concurrency == 0 {
            return Err(Error::Configuration(
                "simulator_concurrency must be positive (unbounded \
                 concurrency is disallowed by design)"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_batch_failure_fraction) {
            return Err(Error::Configuration(format!(
                "max_batch_failure_fraction must be in [0, 1], got {}",
                self.max_batch_failure_fraction
            )));
        }
        if self.r_hat_threshold <= 1.0 {
            return Err(Error::Configuration(format!(
                "r_hat_threshold must exceed 1.0, got {}",
                self.r_hat_threshold
            )));
        }
        if self.mbe_threshold_pct <= 0.0
            || self.cv_rmse_threshold_pct <= 0.0
            || self.mbe_relaxed_pct < self.mbe_threshold_pct
        {
            return Err(Error::Configuration(
                "compliance thresholds must be positive and the relaxed MBE \
                 tier must not be tighter than the primary tier"
                    .to_string(),
            ));
        }
        if self.acquisition_epsilon < 0.0 {
            return Err(Error::Configuration(format!(
                "acquisition_epsilon must be non-negative, got {}",
                self.acquisition_epsilon
            )));
        }
        Ok(())
    }
}
