//! Calibration session orchestration
//!
//! One session owns the parameter space, the surrogate manager, and the
//! simulator pool, and drives the loop: initial design, surrogate fit,
//! posterior round, compliance check, active-learning refinement, repeat
//! until acceptance, budget exhaustion, diminishing surrogate returns, or
//! cancellation. Calibrated parameters are never reported without their
//! convergence diagnostics and compliance metrics attached.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::active::{self, CvTracker};
use crate::compliance::{self, ComplianceReport};
use crate::error::ConvergenceDetail;
use crate::sampler::{self, PosteriorModel, PosteriorTrace};
use crate::simulator::{
    check_batch_failures, ObservedData, SimulationContext, Simulator, SimulatorPool,
};
use crate::space::{design, MarginalSummary, ParameterSpace};
use crate::surrogate::{DesignPoint, SurrogateManager, TrainingSet};
use crate::{CalibrationConfig, CancelHandle, Error, Result};

/// Terminal (or in-flight) status of a calibration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// The loop is still running
    Running,
    /// Diagnostics and compliance both passed
    Accepted,
    /// Loop ended without meeting the compliance thresholds
    Rejected,
    /// Convergence or batch failure ended the session early
    Failed,
    /// Cooperative cancellation; partial results returned intact
    Cancelled,
}

/// Everything a downstream consumer may see: parameters only ever travel
/// together with the diagnostics and compliance evidence behind them.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    /// Terminal status
    pub status: SessionStatus,
    /// Completed posterior traces, oldest first
    pub traces: Vec<PosteriorTrace>,
    /// Accumulated training set
    pub training: TrainingSet,
    /// Latest compliance report, if a validation run completed
    pub compliance: Option<ComplianceReport>,
    /// Convergence failures when `status == Failed`
    pub convergence_failures: Vec<ConvergenceDetail>,
    /// Cumulative expensive simulator evaluations dispatched
    pub evaluations_used: usize,
    /// Completed active-learning iterations
    pub iterations: usize,
    /// Wall-clock bracket of the run
    pub started_at: DateTime<Utc>,
    /// End of the run
    pub finished_at: DateTime<Utc>,
}

impl CalibrationOutcome {
    /// Posterior summary per parameter from the most recent trace.
    #[must_use]
    pub fn posterior_summary(&self) -> Vec<(String, MarginalSummary)> {
        self.traces.last().map(PosteriorTrace::summary).unwrap_or_default()
    }

    /// `n` posterior parameter draws for downstream Monte Carlo
    /// propagation (seeded independently of the calibration RNG).
    #[must_use]
    pub fn posterior_samples(&self, n: usize, seed: u64) -> Vec<Vec<f64>> {
        self.traces.last().map_or_else(Vec::new, |trace| {
            let mut rng = StdRng::seed_from_u64(seed);
            trace.draws(n, &mut rng)
        })
    }

    /// Latest compliance report.
    #[must_use]
    pub fn compliance_report(&self) -> Option<&ComplianceReport> {
        self.compliance.as_ref()
    }
}

/// Serializable snapshot for resuming an interrupted session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Configuration the session ran with
    pub config: CalibrationConfig,
    /// Parameter space including posterior summaries
    pub space: ParameterSpace,
    /// Observed data being calibrated against
    pub observed: ObservedData,
    /// Training set accumulated so far
    pub training: TrainingSet,
    /// Completed posterior traces
    pub traces: Vec<PosteriorTrace>,
    /// Status at save time
    pub status: SessionStatus,
    /// Expensive evaluations already spent
    pub evaluations_used: usize,
    /// Snapshot timestamp
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Persist to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns serialization or IO errors.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns deserialization or IO errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut snapshot: Self = serde_json::from_str(&json)?;
        snapshot.space.rebuild_index();
        Ok(snapshot)
    }
}

/// Surrogate-assisted Bayesian calibration session.
pub struct CalibrationSession {
    space: ParameterSpace,
    observed: ObservedData,
    config: CalibrationConfig,
    pool: SimulatorPool,
    manager: SurrogateManager,
    traces: Vec<PosteriorTrace>,
    evaluations_used: usize,
    iterations: usize,
    status: SessionStatus,
    cancel: CancelHandle,
    cv: CvTracker,
    started_at: DateTime<Utc>,
}

impl CalibrationSession {
    /// Create a session over a registered parameter space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on an invalid config, an empty
    /// space, or an initial design size below `max(2, dim + 1)`.
    pub fn new(
        space: ParameterSpace,
        observed: ObservedData,
        simulator: Arc<dyn Simulator>,
        ctx: SimulationContext,
        config: CalibrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        if space.dim() == 0 {
            return Err(Error::Configuration(
                "parameter space is empty; register at least one parameter".to_string(),
            ));
        }
        let minimum = 2.max(space.dim() + 1);
        if config.initial_design_size < minimum {
            return Err(Error::Configuration(format!(
                "initial_design_size {} is below the required minimum {minimum}",
                config.initial_design_size
            )));
        }
        let pool = SimulatorPool::new(
            simulator,
            ctx,
            config.simulator_concurrency,
            Duration::from_millis(config.simulator_timeout_ms),
        );
        let manager = SurrogateManager::new(&space, observed.len());
        Ok(Self {
            space,
            observed,
            config,
            pool,
            manager,
            traces: Vec::new(),
            evaluations_used: 0,
            iterations: 0,
            status: SessionStatus::Running,
            cancel: CancelHandle::new(),
            cv: CvTracker::new(),
            started_at: Utc::now(),
        })
    }

    /// Rebuild a session from a persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the snapshot's training set
    /// is inconsistent with the restored space.
    pub fn resume(
        snapshot: SessionSnapshot,
        simulator: Arc<dyn Simulator>,
        ctx: SimulationContext,
    ) -> Result<Self> {
        let mut session = Self::new(
            snapshot.space,
            snapshot.observed,
            simulator,
            ctx,
            snapshot.config,
        )?;
        session.manager = SurrogateManager::restore(
            &session.space,
            session.observed.len(),
            snapshot.training,
        )?;
        session.traces = snapshot.traces;
        session.evaluations_used = snapshot.evaluations_used;
        Ok(session)
    }

    /// Handle for cooperative cancellation from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// Snapshot the resumable state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            config: self.config.clone(),
            space: self.space.clone(),
            observed: self.observed.clone(),
            training: self.manager.training_snapshot(),
            traces: self.traces.clone(),
            status: self.status,
            evaluations_used: self.evaluations_used,
            saved_at: Utc::now(),
        }
    }

    /// Drive the calibration loop to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionFailure`] when a batch exceeds the failure
    /// fraction, and configuration errors from invalid state. Convergence
    /// failure is NOT an `Err`: it terminates with `status == Failed` and
    /// the per-parameter details inside the outcome, with all prior traces
    /// and the training set intact.
    pub async fn run(&mut self) -> Result<CalibrationOutcome> {
        self.started_at = Utc::now();
        info!(
            dim = self.space.dim(),
            periods = self.observed.len(),
            budget = self.config.evaluation_budget,
            "calibration session started"
        );

        // Phase 1: initial space-filling design.
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        if self.manager.is_empty() {
            let initial = design::latin_hypercube(
                &self.space,
                self.config.initial_design_size,
                self.config.strata_mode,
                &mut rng,
            )?;
            let outcomes = self.pool.evaluate_batch(initial, &self.cancel).await;
            if self.cancel.is_cancelled() {
                return Ok(self.finish(SessionStatus::Cancelled, None, Vec::new()));
            }
            check_batch_failures(&outcomes, self.config.max_batch_failure_fraction)?;
            self.evaluations_used += outcomes.len();
            let points: Vec<DesignPoint> = outcomes
                .into_iter()
                .filter_map(|(theta, result)| match result {
                    Ok(observable) => Some(DesignPoint::new(theta, observable)),
                    Err(failure) => {
                        warn!(%failure, "initial design point dropped");
                        None
                    }
                })
                .collect();
            self.manager.append(points)?;
        }

        // Phase 2: iterate sample -> validate -> refine.
        let mut last_report: Option<ComplianceReport> = None;
        for iteration in 0..self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(SessionStatus::Cancelled, last_report, Vec::new()));
            }
            // Every round ends in a validation run; without budget for it
            // there is nothing left to do.
            if self.evaluations_used >= self.config.evaluation_budget {
                info!("evaluation budget exhausted");
                break;
            }

            let surrogate = self.manager.current();
            let round = sampler::sample_posterior(
                &self.space,
                Arc::clone(&surrogate),
                &self.observed,
                &self.config,
                iteration,
                &self.cancel,
            );
            let trace = match round {
                Ok(Some(trace)) => trace,
                Ok(None) => {
                    return Ok(self.finish(SessionStatus::Cancelled, last_report, Vec::new()))
                }
                Err(Error::Convergence(details)) => {
                    return Ok(self.finish(SessionStatus::Failed, last_report, details))
                }
                Err(other) => return Err(other),
            };
            for (name, summary) in trace.summary() {
                self.space.update_posterior(&name, summary);
            }
            self.traces.push(trace);
            self.iterations = iteration + 1;

            // Phase 2b: real validation runs at the posterior mean (and
            // optionally further posterior draws).
            if let Some(report) = self.validate(&mut rng).await? {
                let accepted = report.accepted;
                last_report = Some(report);
                if accepted {
                    return Ok(self.finish(SessionStatus::Accepted, last_report, Vec::new()));
                }
            } else {
                return Ok(self.finish(SessionStatus::Cancelled, last_report, Vec::new()));
            }

            // Phase 2c: stopping rules before spending more evaluations.
            if self.evaluations_used >= self.config.evaluation_budget {
                info!("evaluation budget exhausted");
                break;
            }
            if let Some(rmse) = self.manager.current().loo_cv_rmse() {
                if self.cv.update(rmse, self.config.cv_improvement_threshold) {
                    info!(rmse, "surrogate cross-validation improvement stalled");
                    break;
                }
            }

            // Phase 2d: active learning refinement.
            let trace_ref = match self.traces.last() {
                Some(t) => t,
                None => break,
            };
            let model = PosteriorModel::new(
                &self.space,
                Arc::clone(&surrogate),
                &self.observed,
            );
            let mut ranking = active::rank_candidates(
                &self.space,
                &surrogate,
                &model,
                trace_ref,
                &self.manager.training_snapshot(),
                &self.config,
                &mut rng,
            )?;

            let remaining = self.config.evaluation_budget - self.evaluations_used;
            let batch_size = self.config.batch_size.min(remaining);
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                match ranking.pop_best() {
                    Some(theta) => batch.push(theta),
                    None => break,
                }
            }
            let mut outcomes = self.pool.evaluate_batch(batch, &self.cancel).await;
            if self.cancel.is_cancelled() {
                return Ok(self.finish(SessionStatus::Cancelled, last_report, Vec::new()));
            }
            // One replacement per failed point, drawn from the same ranking,
            // never past the evaluation budget.
            let failures = outcomes.iter().filter(|(_, r)| r.is_err()).count();
            let spare_budget = remaining - outcomes.len();
            let wanted = failures.min(spare_budget);
            if wanted > 0 {
                let mut replacements = Vec::with_capacity(wanted);
                for _ in 0..wanted {
                    match ranking.pop_best() {
                        Some(theta) => replacements.push(theta),
                        None => break,
                    }
                }
                if !replacements.is_empty() {
                    info!(
                        failed = failures,
                        replacements = replacements.len(),
                        spare_budget,
                        "drawing replacement candidates"
                    );
                    let extra = self.pool.evaluate_batch(replacements, &self.cancel).await;
                    outcomes.extend(extra);
                }
            }
            check_batch_failures(&outcomes, self.config.max_batch_failure_fraction)?;
            self.evaluations_used += outcomes.len();

            let points: Vec<DesignPoint> = outcomes
                .into_iter()
                .filter_map(|(theta, result)| match result {
                    Ok(observable) => Some(DesignPoint::new(theta, observable)),
                    Err(failure) => {
                        warn!(%failure, "candidate evaluation dropped");
                        None
                    }
                })
                .collect();
            self.manager.append(points)?;
        }

        Ok(self.finish(SessionStatus::Rejected, last_report, Vec::new()))
    }

    /// Run the real-simulator validation and evaluate compliance.
    /// `Ok(None)` signals cancellation.
    async fn validate(&mut self, rng: &mut StdRng) -> Result<Option<ComplianceReport>> {
        let Some(trace) = self.traces.last() else {
            return Err(Error::Configuration(
                "validation requested before any posterior trace".to_string(),
            ));
        };
        let mut points = vec![trace.posterior_mean()];
        for extra in trace.draws(self.config.validation_draws.saturating_sub(1), rng) {
            points.push(extra);
        }
        // Posterior means can drift a hair outside bounds numerically.
        for point in &mut points {
            for (x, (lo, hi)) in point.iter_mut().zip(self.space.bounds()) {
                *x = x.clamp(lo, hi);
            }
        }
        // Extra validation draws only while budget remains; the loop
        // guarantees room for the posterior-mean run itself.
        let remaining = self
            .config
            .evaluation_budget
            .saturating_sub(self.evaluations_used);
        points.truncate(remaining.max(1));
        let outcomes = self.pool.evaluate_batch(points, &self.cancel).await;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        check_batch_failures(&outcomes, self.config.max_batch_failure_fraction)?;
        self.evaluations_used += outcomes.len();

        let successes: Vec<&crate::simulator::Observable> = outcomes
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .collect();
        if successes.is_empty() {
            return Err(Error::SessionFailure {
                failed: outcomes.len(),
                attempted: outcomes.len(),
                limit_fraction: self.config.max_batch_failure_fraction * 100.0,
            });
        }
        let mut simulated = vec![0.0; self.observed.len()];
        for observable in &successes {
            for (s, &v) in simulated.iter_mut().zip(&observable.values) {
                *s += v / successes.len() as f64;
            }
        }
        compliance::evaluate(&self.observed, &simulated, &self.config).map(Some)
    }

    fn finish(
        &mut self,
        status: SessionStatus,
        compliance: Option<ComplianceReport>,
        convergence_failures: Vec<ConvergenceDetail>,
    ) -> CalibrationOutcome {
        self.status = status;
        info!(
            ?status,
            iterations = self.iterations,
            evaluations = self.evaluations_used,
            traces = self.traces.len(),
            "calibration session finished"
        );
        CalibrationOutcome {
            status,
            traces: self.traces.clone(),
            training: self.manager.training_snapshot(),
            compliance,
            convergence_failures,
            evaluations_used: self.evaluations_used,
            iterations: self.iterations,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{FnSimulator, Observable};
    use crate::space::Distribution;

    fn unit_space(dim: usize) -> ParameterSpace {
        let mut space = ParameterSpace::new();
        for d in 0..dim {
            space
                .register(
                    format!("x{d}"),
                    Distribution::Uniform {
                        low: 0.0,
                        high: 1.0,
                    },
                    (0.0, 1.0),
                )
                .unwrap();
        }
        space
    }

    fn sum_sim() -> Arc<dyn Simulator> {
        Arc::new(FnSimulator(|theta: &[f64]| {
            Ok(Observable::scalar(theta.iter().sum()))
        }))
    }

    #[test]
    fn undersized_initial_design_rejected() {
        let config = CalibrationConfig {
            initial_design_size: 3,
            ..CalibrationConfig::default()
        };
        let session = CalibrationSession::new(
            unit_space(3),
            ObservedData::new(vec![1.5], vec![0.05]).unwrap(),
            sum_sim(),
            SimulationContext::new(),
            config,
        );
        assert!(matches!(session, Err(Error::Configuration(_))));
    }

    #[test]
    fn empty_space_rejected() {
        let session = CalibrationSession::new(
            ParameterSpace::new(),
            ObservedData::new(vec![1.0], vec![0.1]).unwrap(),
            sum_sim(),
            SimulationContext::new(),
            CalibrationConfig::default(),
        );
        assert!(session.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_json() {
        let session = CalibrationSession::new(
            unit_space(2),
            ObservedData::new(vec![1.0], vec![0.1]).unwrap(),
            sum_sim(),
            SimulationContext::new(),
            CalibrationConfig::default(),
        )
        .unwrap();
        let snapshot = session.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.evaluations_used, 0);
        assert_eq!(back.status, SessionStatus::Running);
        let resumed = CalibrationSession::resume(back, sum_sim(), SimulationContext::new());
        assert!(resumed.is_ok());
    }
}
