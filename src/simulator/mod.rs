//! Simulator adapter boundary
//!
//! The expensive physical simulator is reached only through the [`Simulator`]
//! trait, dispatched via a bounded worker pool with a per-call timeout.
//! A timeout or a non-convergent run is an [`EvaluationFailure`], never a
//! synthetic value; unbounded concurrency is disallowed by design because a
//! single call can pin a core and hundreds of megabytes for minutes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{CancelHandle, Error, Result};

pub use crate::error::EvaluationFailure;

/// One simulator output: a vector of observable values (e.g. 12 monthly
/// energy totals; a scalar observable has length 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    /// Output values, finest granularity first-class
    pub values: Vec<f64>,
}

impl Observable {
    /// Wrap a scalar output.
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            values: vec![value],
        }
    }

    /// Number of output components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the observable carries no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Observed measurements the calibration targets, with per-observation
/// uncertainty (standard deviation) and period labels for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedData {
    /// Observed values, one per period
    pub values: Vec<f64>,
    /// Measurement standard deviation per period
    pub uncertainty: Vec<f64>,
    /// Human-readable period labels ("2024-01", "month_6", ...)
    pub periods: Vec<String>,
}

impl ObservedData {
    /// Build observed data with uniform labels `period_0..period_{n-1}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on empty data, length mismatch, or
    /// non-positive uncertainty.
    pub fn new(values: Vec<f64>, uncertainty: Vec<f64>) -> Result<Self> {
        let periods = (0..values.len()).map(|i| format!("period_{i}")).collect();
        Self::with_periods(values, uncertainty, periods)
    }

    /// Build observed data with explicit period labels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on empty data, length mismatch, or
    /// non-positive uncertainty.
    pub fn with_periods(
        values: Vec<f64>,
        uncertainty: Vec<f64>,
        periods: Vec<String>,
    ) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::Configuration(
                "observed data must contain at least one period".to_string(),
            ));
        }
        if values.len() != uncertainty.len() || values.len() != periods.len() {
            return Err(Error::Configuration(format!(
                "observed data lengths disagree: {} values, {} uncertainties, {} periods",
                values.len(),
                uncertainty.len(),
                periods.len()
            )));
        }
        if uncertainty.iter().any(|&u| !u.is_finite() || u <= 0.0) {
            return Err(Error::Configuration(
                "observation uncertainty must be positive and finite".to_string(),
            ));
        }
        Ok(Self {
            values,
            uncertainty,
            periods,
        })
    }

    /// Number of observation periods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no periods are present (cannot occur after construction).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Inputs held fixed across every simulator run of a session
/// (weather file, baseline model id, schedule set, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationContext {
    /// Opaque key/value context forwarded to the adapter
    pub fields: BTreeMap<String, String>,
}

impl SimulationContext {
    /// Empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a context field, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// The expensive external simulator. Implementations must be deterministic
/// given identical inputs, and may block for minutes per call.
pub trait Simulator: Send + Sync {
    /// Run one parameter vector through the simulator.
    ///
    /// # Errors
    ///
    /// Returns [`EvaluationFailure`] when the run crashes or does not
    /// converge. Timeouts are enforced by the pool, not the adapter.
    fn evaluate(
        &self,
        theta: &[f64],
        ctx: &SimulationContext,
    ) -> std::result::Result<Observable, EvaluationFailure>;
}

/// Closure-backed adapter for tests and cheap analytic stand-ins.
pub struct FnSimulator<F>(pub F);

impl<F> Simulator for FnSimulator<F>
where
    F: Fn(&[f64]) -> std::result::Result<Observable, EvaluationFailure> + Send + Sync,
{
    fn evaluate(
        &self,
        theta: &[f64],
        _ctx: &SimulationContext,
    ) -> std::result::Result<Observable, EvaluationFailure> {
        (self.0)(theta)
    }
}

/// Outcome of one dispatched evaluation: the point and what happened to it.
pub type EvaluationOutcome = (Vec<f64>, std::result::Result<Observable, EvaluationFailure>);

/// Bounded worker pool in front of a [`Simulator`].
///
/// Concurrency is capped by a semaphore and every call runs under a timeout
/// on a blocking worker thread. The pool never holds a lock across a call.
pub struct SimulatorPool {
    simulator: Arc<dyn Simulator>,
    ctx: SimulationContext,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl SimulatorPool {
    /// Wrap a simulator with a concurrency cap and per-call timeout.
    #[must_use]
    pub fn new(
        simulator: Arc<dyn Simulator>,
        ctx: SimulationContext,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            simulator,
            ctx,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
        }
    }

    /// Evaluate a single point under the pool's cap and timeout.
    pub async fn evaluate_one(
        &self,
        theta: Vec<f64>,
    ) -> std::result::Result<Observable, EvaluationFailure> {
        dispatch(
            Arc::clone(&self.simulator),
            self.ctx.clone(),
            Arc::clone(&self.semaphore),
            self.timeout,
            theta,
        )
        .await
    }

    /// Evaluate a batch of points, checking for cancellation between
    /// dispatches. Every point gets its own task so calls overlap up to the
    /// semaphore cap; outcomes come back in dispatch order. Already-running
    /// calls run to completion; points not yet dispatched are skipped once
    /// cancellation is observed.
    pub async fn evaluate_batch(
        &self,
        points: Vec<Vec<f64>>,
        cancel: &CancelHandle,
    ) -> Vec<EvaluationOutcome> {
        let mut handles = Vec::with_capacity(points.len());
        let mut dispatched = Vec::with_capacity(points.len());
        for theta in points {
            if cancel.is_cancelled() {
                debug!("cancellation observed before dispatch, skipping remaining points");
                break;
            }
            dispatched.push(theta.clone());
            handles.push(tokio::spawn(dispatch(
                Arc::clone(&self.simulator),
                self.ctx.clone(),
                Arc::clone(&self.semaphore),
                self.timeout,
                theta,
            )));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(EvaluationFailure::Crashed(format!(
                    "simulator task aborted: {join_err}"
                ))),
            });
        }
        dispatched.into_iter().zip(results).collect()
    }
}

/// One pooled call: bounded by the semaphore, run on a blocking worker,
/// cut off by the timeout.
async fn dispatch(
    simulator: Arc<dyn Simulator>,
    ctx: SimulationContext,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    theta: Vec<f64>,
) -> std::result::Result<Observable, EvaluationFailure> {
    // Semaphore is never closed, so acquire cannot fail.
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return Err(EvaluationFailure::Crashed(
            "simulator pool shut down".to_string(),
        ));
    };
    let timeout_ms = timeout.as_millis() as u64;
    let call = tokio::task::spawn_blocking(move || simulator.evaluate(&theta, &ctx));
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(EvaluationFailure::Crashed(format!(
            "simulator worker panicked: {join_err}"
        ))),
        Err(_) => {
            warn!(timeout_ms, "simulator call timed out");
            Err(EvaluationFailure::TimedOut(timeout_ms))
        }
    }
}

/// Escalate when too many evaluations in one batch failed.
///
/// # Errors
///
/// Returns [`Error::SessionFailure`] when the failed fraction exceeds
/// `max_fraction` (a batch with no attempts never escalates).
pub fn check_batch_failures(outcomes: &[EvaluationOutcome], max_fraction: f64) -> Result<()> {
    let attempted = outcomes.len();
    if attempted == 0 {
        return Ok(());
    }
    let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
    if failed as f64 / attempted as f64 > max_fraction {
        return Err(Error::SessionFailure {
            failed,
            attempted,
            limit_fraction: max_fraction * 100.0,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_simulator() -> Arc<dyn Simulator> {
        Arc::new(FnSimulator(|theta: &[f64]| {
            Ok(Observable::scalar(theta.iter().sum()))
        }))
    }

    #[tokio::test]
    async fn pool_evaluates_points() {
        let pool = SimulatorPool::new(
            sum_simulator(),
            SimulationContext::new(),
            2,
            Duration::from_secs(5),
        );
        let result = pool.evaluate_one(vec![0.25, 0.5, 0.75]).await.unwrap();
        assert!((result.values[0] - 1.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn timeout_becomes_evaluation_failure() {
        let slow: Arc<dyn Simulator> = Arc::new(FnSimulator(|_: &[f64]| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Observable::scalar(0.0))
        }));
        let pool = SimulatorPool::new(
            slow,
            SimulationContext::new(),
            1,
            Duration::from_millis(20),
        );
        let result = pool.evaluate_one(vec![1.0]).await;
        assert!(matches!(result, Err(EvaluationFailure::TimedOut(_))));
    }

    #[tokio::test]
    async fn batch_calls_overlap_up_to_the_cap() {
        let slow: Arc<dyn Simulator> = Arc::new(FnSimulator(|theta: &[f64]| {
            std::thread::sleep(Duration::from_millis(150));
            Ok(Observable::scalar(theta[0]))
        }));
        let pool = SimulatorPool::new(slow, SimulationContext::new(), 4, Duration::from_secs(5));
        let cancel = CancelHandle::new();
        let start = std::time::Instant::now();
        let outcomes = pool
            .evaluate_batch(vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]], &cancel)
            .await;
        let elapsed = start.elapsed();
        assert_eq!(outcomes.len(), 4);
        // Outcomes keep dispatch order.
        for (i, (theta, result)) in outcomes.iter().enumerate() {
            assert!((theta[0] - (i + 1) as f64).abs() < 1e-12);
            assert!(result.is_ok());
        }
        // Four 150 ms calls at concurrency 4 must beat the 600 ms a
        // sequential pool would need.
        assert!(
            elapsed < Duration::from_millis(450),
            "batch took {elapsed:?}, calls did not overlap"
        );
    }

    #[tokio::test]
    async fn batch_respects_cancellation() {
        let pool = SimulatorPool::new(
            sum_simulator(),
            SimulationContext::new(),
            1,
            Duration::from_secs(5),
        );
        let cancel = CancelHandle::new();
        cancel.cancel();
        let outcomes = pool
            .evaluate_batch(vec![vec![1.0], vec![2.0]], &cancel)
            .await;
        assert!(outcomes.is_empty());
    }

    #[test]
    fn failure_fraction_escalates() {
        let outcomes: Vec<EvaluationOutcome> = vec![
            (vec![0.1], Ok(Observable::scalar(1.0))),
            (vec![0.2], Err(EvaluationFailure::NonConvergent("n".into()))),
            (vec![0.3], Err(EvaluationFailure::TimedOut(10))),
        ];
        assert!(check_batch_failures(&outcomes, 0.5).is_err());
        assert!(check_batch_failures(&outcomes, 0.7).is_ok());
    }

    #[test]
    fn observed_data_validation() {
        assert!(ObservedData::new(vec![], vec![]).is_err());
        assert!(ObservedData::new(vec![1.0], vec![0.0]).is_err());
        let data = ObservedData::new(vec![1.0, 2.0], vec![0.1, 0.1]).unwrap();
        assert_eq!(data.periods.len(), 2);
    }
}
