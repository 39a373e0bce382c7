//! # Calibra: Surrogate-Assisted Bayesian Calibration
//!
//! Calibra calibrates expensive physical simulators (building energy
//! models, thermal networks) against measured data. A Gaussian-process
//! surrogate stands in for the simulator inside the MCMC loop, so a
//! posterior costs thousands of surrogate reads but only dozens of real
//! simulator runs, chosen by an active-learning acquisition rule.
//!
//! The loop: Latin hypercube design → surrogate fit → HMC/random-walk
//! posterior round → real-simulator validation scored by ASHRAE
//! Guideline 14 metrics (MBE, CV(RMSE)) → refine where the posterior
//! concentrates, until acceptance or budget exhaustion.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use calibra::simulator::{FnSimulator, Observable, ObservedData, SimulationContext, Simulator};
//! use calibra::space::{Distribution, ParameterSpace};
//! use calibra::session::CalibrationSession;
//! use calibra::CalibrationConfig;
//!
//! # #[tokio::main] async fn main() -> calibra::Result<()> {
//! let mut space = ParameterSpace::new();
//! space.register(
//!     "infiltration_mult",
//!     Distribution::Normal { mean: 1.0, std: 0.3 },
//!     (0.2, 3.0),
//! )?;
//! let observed = ObservedData::new(vec![1240.0], vec![25.0])?;
//! let simulator: Arc<dyn Simulator> = Arc::new(FnSimulator(|theta: &[f64]| {
//!     Ok(Observable::scalar(1100.0 * theta[0]))
//! }));
//! let mut session = CalibrationSession::new(
//!     space,
//!     observed,
//!     simulator,
//!     SimulationContext::new(),
//!     CalibrationConfig::default(),
//! )?;
//! let outcome = session.run().await?;
//! println!("{:?}", outcome.status);
//! # Ok(()) }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod active;
pub mod compliance;
pub mod config;
pub mod error;
pub mod sampler;
pub mod session;
pub mod simulator;
pub mod space;
pub mod surrogate;

pub use config::CalibrationConfig;
pub use error::{ConvergenceDetail, Error, EvaluationFailure, Result};
pub use session::{CalibrationOutcome, CalibrationSession, SessionStatus};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a running session and its
/// owner. Cancellation is observed between simulator dispatches and between
/// MCMC draws; already-dispatched simulator calls run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Fresh, un-cancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once [`cancel`](Self::cancel) has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_across_clones() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
