//! Error types for Calibra
//!
//! The taxonomy separates fatal misconfiguration from locally-recoverable
//! simulator failures and from convergence problems that still return
//! partial results to the caller. Compliance rejection is deliberately
//! NOT an error: it is a structured verdict (see `compliance::ComplianceReport`).

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// One simulator call failed. Recovered locally by excluding the point;
/// never converted into a synthetic observation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationFailure {
    /// The call exceeded its per-call timeout
    #[error("simulator call timed out after {0} ms")]
    TimedOut(u64),

    /// The simulator ran but did not converge to a valid result
    #[error("simulator run did not converge: {0}")]
    NonConvergent(String),

    /// The simulator process/adapter failed outright
    #[error("simulator adapter failed: {0}")]
    Crashed(String),
}

/// Which convergence criterion a parameter failed, and by how much.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceDetail {
    /// Parameter name
    pub parameter: String,
    /// Failing criterion ("r_hat", "ess", or "divergences")
    pub criterion: &'static str,
    /// Observed value of the diagnostic
    pub observed: f64,
    /// Threshold it had to meet
    pub threshold: f64,
}

impl std::fmt::Display for ConvergenceDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} = {:.4} (threshold {:.4})",
            self.parameter, self.criterion, self.observed, self.threshold
        )
    }
}

/// Calibra error types
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid priors, bounds, or sample-size request; fatal, no retry
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Too many simulator failures within one batch
    #[error(
        "batch failure rate too high: {failed}/{attempted} evaluations failed \
         (limit {limit_fraction:.0}%)"
    )]
    SessionFailure {
        /// Evaluations that failed in the batch
        failed: usize,
        /// Evaluations attempted in the batch
        attempted: usize,
        /// Configured failure-fraction limit, in percent
        limit_fraction: f64,
    },

    /// MCMC diagnostics unmet after the single permitted retry
    #[error("MCMC did not converge after retry: {}", format_details(.0))]
    Convergence(Vec<ConvergenceDetail>),

    /// Serialization of persisted state failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error while persisting or resuming a session
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_details(details: &[ConvergenceDetail]) -> String {
    details
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_failure_display() {
        let failure = EvaluationFailure::TimedOut(30_000);
        assert_eq!(
            failure.to_string(),
            "simulator call timed out after 30000 ms"
        );
    }

    #[test]
    fn convergence_error_names_failing_parameter() {
        let err = Error::Convergence(vec![ConvergenceDetail {
            parameter: "infiltration_mult".to_string(),
            criterion: "r_hat",
            observed: 1.083,
            threshold: 1.01,
        }]);
        let message = err.to_string();
        assert!(message.contains("infiltration_mult"));
        assert!(message.contains("r_hat"));
        assert!(message.contains("1.01"));
    }

    #[test]
    fn session_failure_reports_counts() {
        let err = Error::SessionFailure {
            failed: 3,
            attempted: 4,
            limit_fraction: 50.0,
        };
        assert!(err.to_string().contains("3/4"));
    }
}
