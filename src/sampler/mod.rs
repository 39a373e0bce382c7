//! Posterior sampler (MCMC engine)
//!
//! The likelihood treats the surrogate's predictive variance as extra
//! observation noise, so posterior width reflects surrogate ignorance as
//! well as measurement error. Chains run in parallel over a shared
//! read-only surrogate snapshot; sampling happens in logit-unconstrained
//! space so hard bounds never produce rejections at the boundary.
//!
//! Kernel selection: Hamiltonian Monte Carlo with dual-averaging step-size
//! adaptation when the surrogate is differentiable, adaptive random-walk
//! Metropolis otherwise. Tuning draws are discarded; convergence requires
//! split R-hat, ESS, and a divergence budget per round, with one retry at
//! an extended tuning phase before the round fails.

pub mod diagnostics;
mod hmc;
mod rwm;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::simulator::ObservedData;
use crate::space::{MarginalSummary, ParameterSpace};
use crate::surrogate::Surrogate;
use crate::{CalibrationConfig, CancelHandle, Error, Result};

pub use diagnostics::{Diagnostics, ParamDiagnostics};

/// One retained posterior draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSample {
    /// Parameter vector in original units
    pub theta: Vec<f64>,
    /// Log posterior density at `theta`
    pub log_posterior: f64,
    /// Chain that produced the draw
    pub chain: usize,
    /// Draw index within the chain (post-tuning)
    pub draw: usize,
}

/// Which transition kernel a round used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKernel {
    /// Gradient-based Hamiltonian Monte Carlo
    Hmc,
    /// Gradient-free adaptive random-walk Metropolis
    RandomWalk,
}

/// Lifecycle of one sampling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// No chains launched yet
    NotStarted,
    /// Chains are running their adaptation phase
    Tuning,
    /// Retained draws collected, diagnostics pending
    Sampling,
    /// Diagnostics passed; the trace is usable
    Converged,
    /// Diagnostics unmet after the permitted retry
    Failed,
}

fn converged_state() -> RoundState {
    RoundState::Converged
}

/// All retained samples of one sampling round plus its diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorTrace {
    /// Active-learning iteration the round belongs to
    pub round: usize,
    /// Training-set snapshot the surrogate was fitted on
    pub surrogate_version: u64,
    /// Kernel used for every chain in the round
    pub kernel: SamplerKernel,
    /// Retained draws across all chains
    pub samples: Vec<PosteriorSample>,
    /// Per-parameter diagnostics and divergence count
    pub diagnostics: Diagnostics,
    /// Parameter names, registration order
    pub param_names: Vec<String>,
    /// Where the round ended; a stored trace is always `Converged`
    #[serde(default = "converged_state")]
    pub state: RoundState,
}

impl PosteriorTrace {
    /// Posterior mean vector.
    #[must_use]
    pub fn posterior_mean(&self) -> Vec<f64> {
        let dim = self.param_names.len();
        let mut mean = vec![0.0; dim];
        for sample in &self.samples {
            for (m, &x) in mean.iter_mut().zip(&sample.theta) {
                *m += x;
            }
        }
        let n = self.samples.len().max(1) as f64;
        for m in &mut mean {
            *m /= n;
        }
        mean
    }

    /// Per-parameter posterior summaries (mean, std, 90% credible interval).
    #[must_use]
    pub fn summary(&self) -> Vec<(String, MarginalSummary)> {
        let n = self.samples.len();
        self.param_names
            .iter()
            .enumerate()
            .map(|(d, name)| {
                let mut xs: Vec<f64> = self.samples.iter().map(|s| s.theta[d]).collect();
                xs.sort_by(f64::total_cmp);
                let mean = xs.iter().sum::<f64>() / n as f64;
                let std =
                    (xs.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
                let lower = xs[((n as f64 * 0.05) as usize).min(n - 1)];
                let upper = xs[((n as f64 * 0.95) as usize).min(n - 1)];
                (
                    name.clone(),
                    MarginalSummary {
                        mean,
                        std,
                        ci_lower: lower,
                        ci_upper: upper,
                    },
                )
            })
            .collect()
    }

    /// Draw `n` parameter vectors uniformly from the retained samples
    /// (Monte Carlo propagation for downstream consumers).
    #[must_use]
    pub fn draws(&self, n: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
        (0..n)
            .map(|_| {
                let i = rng.gen_range(0..self.samples.len());
                self.samples[i].theta.clone()
            })
            .collect()
    }
}

/// Logit transform between the bounded parameter box and unconstrained
/// sampling space.
#[derive(Debug, Clone)]
pub(crate) struct BoundsTransform {
    bounds: Vec<(f64, f64)>,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl BoundsTransform {
    fn new(space: &ParameterSpace) -> Self {
        Self {
            bounds: space.bounds(),
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.bounds.len()
    }

    pub(crate) fn to_unconstrained(&self, theta: &[f64]) -> Vec<f64> {
        theta
            .iter()
            .zip(&self.bounds)
            .map(|(&x, &(lo, hi))| {
                let u = ((x - lo) / (hi - lo)).clamp(1e-9, 1.0 - 1e-9);
                (u / (1.0 - u)).ln()
            })
            .collect()
    }

    pub(crate) fn to_constrained(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(&self.bounds)
            .map(|(&zd, &(lo, hi))| lo + (hi - lo) * sigmoid(zd))
            .collect()
    }

    /// ln |dx/dz| summed over dimensions.
    fn log_jacobian(&self, z: &[f64]) -> f64 {
        z.iter()
            .zip(&self.bounds)
            .map(|(&zd, &(lo, hi))| {
                let s = sigmoid(zd);
                (hi - lo).ln() + (s.max(1e-300)).ln() + ((1.0 - s).max(1e-300)).ln()
            })
            .sum()
    }
}

/// The target density: priors plus the surrogate-noise-widened likelihood.
///
/// Shares only read-only state across chains (a surrogate snapshot, the
/// priors, and the observed data).
pub struct PosteriorModel {
    space: ParameterSpace,
    surrogate: Arc<Surrogate>,
    observed: ObservedData,
    transform: BoundsTransform,
}

impl PosteriorModel {
    /// Bind a surrogate snapshot and observed data to the parameter space.
    #[must_use]
    pub fn new(space: &ParameterSpace, surrogate: Arc<Surrogate>, observed: &ObservedData) -> Self {
        Self {
            transform: BoundsTransform::new(space),
            space: space.clone(),
            surrogate,
            observed: observed.clone(),
        }
    }

    /// Log posterior density at a raw parameter vector.
    #[must_use]
    pub fn log_posterior(&self, theta: &[f64]) -> f64 {
        let lp = self.space.log_prior(theta);
        if !lp.is_finite() {
            return f64::NEG_INFINITY;
        }
        lp + self.log_likelihood(theta)
    }

    fn log_likelihood(&self, theta: &[f64]) -> f64 {
        let (mu, var) = self.surrogate.predict(theta);
        let mut ll = 0.0;
        for k in 0..self.observed.len() {
            let s2 = self.observed.uncertainty[k].powi(2) + var[k].max(0.0);
            let r = self.observed.values[k] - mu[k];
            ll += -0.5 * (2.0 * std::f64::consts::PI * s2).ln() - 0.5 * r * r / s2;
        }
        ll
    }

    /// True when the surrogate exposes analytic gradients.
    #[must_use]
    pub fn supports_gradient(&self) -> bool {
        let probe: Vec<f64> = self
            .space
            .bounds()
            .iter()
            .map(|&(lo, hi)| 0.5 * (lo + hi))
            .collect();
        self.surrogate.gradient(&probe).is_some()
    }

    /// Log density in unconstrained space (Jacobian included).
    pub(crate) fn logp_z(&self, z: &[f64]) -> f64 {
        let theta = self.transform.to_constrained(z);
        self.log_posterior(&theta) + self.transform.log_jacobian(z)
    }

    /// Log density and gradient in unconstrained space.
    /// `None` when the surrogate has no gradient.
    pub(crate) fn grad_z(&self, z: &[f64]) -> Option<(f64, Vec<f64>)> {
        let theta = self.transform.to_constrained(z);
        let lp_x = self.log_posterior(&theta);
        if !lp_x.is_finite() {
            return Some((f64::NEG_INFINITY, vec![0.0; z.len()]));
        }
        let grad_sur = self.surrogate.gradient(&theta)?;
        let (mu, var) = self.surrogate.predict(&theta);

        // d log-likelihood / d theta
        let dim = z.len();
        let mut grad_x = vec![0.0; dim];
        for k in 0..self.observed.len() {
            let s2 = self.observed.uncertainty[k].powi(2) + var[k].max(0.0);
            let r = self.observed.values[k] - mu[k];
            let var_coeff = r * r / (2.0 * s2 * s2) - 1.0 / (2.0 * s2);
            for d in 0..dim {
                grad_x[d] += r / s2 * grad_sur.dmeans[k][d] + var_coeff * grad_sur.dvars[k][d];
            }
        }
        // d log-prior / d theta
        for (d, param) in self.space.params().iter().enumerate() {
            grad_x[d] += param.distribution().ln_pdf_grad(theta[d]);
        }
        // Chain rule into z-space plus the Jacobian's own gradient.
        let mut grad = vec![0.0; dim];
        for d in 0..dim {
            let (lo, hi) = self.transform.bounds[d];
            let s = sigmoid(z[d]);
            grad[d] = grad_x[d] * (hi - lo) * s * (1.0 - s) + (1.0 - 2.0 * s);
        }
        Some((lp_x + self.transform.log_jacobian(z), grad))
    }

    pub(crate) fn transform(&self) -> &BoundsTransform {
        &self.transform
    }

    fn prior_init_z(&self, rng: &mut StdRng) -> Vec<f64> {
        let theta = self.space.sample_prior(rng);
        self.transform.to_unconstrained(&theta)
    }
}

/// Raw output of one chain, still in unconstrained space.
pub(crate) struct ChainRun {
    pub(crate) draws_z: Vec<Vec<f64>>,
    pub(crate) logps: Vec<f64>,
    pub(crate) divergences: usize,
    pub(crate) cancelled: bool,
}

/// Run one full sampling round against a surrogate snapshot.
///
/// Returns `Ok(None)` when cancellation was observed mid-round; the session
/// then falls back to its last completed trace.
///
/// # Errors
///
/// Returns [`Error::Convergence`] when diagnostics are still unmet after
/// the single permitted retry with an extended tuning phase.
pub fn sample_posterior(
    space: &ParameterSpace,
    surrogate: Arc<Surrogate>,
    observed: &ObservedData,
    config: &CalibrationConfig,
    round: usize,
    cancel: &CancelHandle,
) -> Result<Option<PosteriorTrace>> {
    let model = PosteriorModel::new(space, surrogate, observed);
    let kernel = if model.supports_gradient() {
        SamplerKernel::Hmc
    } else {
        SamplerKernel::RandomWalk
    };
    let names: Vec<String> = space.params().iter().map(|p| p.name().to_string()).collect();

    let mut last_failures = Vec::new();
    let mut state = RoundState::NotStarted;
    debug!(round, ?kernel, ?state, "sampling round queued");
    for attempt in 0..2 {
        let tuning = if attempt == 0 {
            config.tuning_draws
        } else {
            config.tuning_draws * config.retry_tuning_multiplier
        };
        state = RoundState::Tuning;
        debug!(round, attempt, tuning, ?kernel, ?state, "starting sampling round");

        let runs: Vec<ChainRun> = (0..config.chains)
            .into_par_iter()
            .map(|chain| {
                let seed = config
                    .seed
                    .wrapping_add(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(
                        (round as u64 + 1) * 1000 + (attempt as u64) * 100 + chain as u64,
                    ));
                let mut rng = StdRng::seed_from_u64(seed);
                let init = model.prior_init_z(&mut rng);
                match kernel {
                    SamplerKernel::Hmc => hmc::run_chain(
                        &model,
                        init,
                        tuning,
                        config.sampling_draws,
                        &mut rng,
                        cancel,
                    ),
                    SamplerKernel::RandomWalk => rwm::run_chain(
                        &model,
                        init,
                        tuning,
                        config.sampling_draws,
                        &mut rng,
                        cancel,
                    ),
                }
            })
            .collect();

        if runs.iter().any(|r| r.cancelled) {
            info!(round, "sampling round cancelled");
            return Ok(None);
        }
        state = RoundState::Sampling;

        let divergences: usize = runs.iter().map(|r| r.divergences).sum();
        let chains_x: Vec<Vec<Vec<f64>>> = runs
            .iter()
            .map(|r| {
                r.draws_z
                    .iter()
                    .map(|z| model.transform.to_constrained(z))
                    .collect()
            })
            .collect();
        let diag = Diagnostics::compute(&names, &chains_x, divergences);

        match diag.check(config) {
            Ok(()) => {
                state = RoundState::Converged;
                let mut samples = Vec::with_capacity(config.chains * config.sampling_draws);
                for (chain_id, (run, chain_x)) in runs.iter().zip(&chains_x).enumerate() {
                    for (draw, (theta, &lp)) in chain_x.iter().zip(&run.logps).enumerate() {
                        samples.push(PosteriorSample {
                            theta: theta.clone(),
                            log_posterior: lp,
                            chain: chain_id,
                            draw,
                        });
                    }
                }
                info!(
                    round,
                    attempt,
                    samples = samples.len(),
                    divergences,
                    ?state,
                    "sampling round converged"
                );
                return Ok(Some(PosteriorTrace {
                    round,
                    surrogate_version: model.surrogate.version(),
                    kernel,
                    samples,
                    diagnostics: diag,
                    param_names: names,
                    state,
                }));
            }
            Err(failures) => {
                state = RoundState::Failed;
                warn!(
                    round,
                    attempt,
                    failures = failures.len(),
                    ?state,
                    "sampling round failed diagnostics"
                );
                last_failures = failures;
            }
        }
    }
    Err(Error::Convergence(last_failures))
}

/// Standard normal draw (Box-Muller), shared by both kernels.
pub(crate) fn randn(rng: &mut StdRng) -> f64 {
    let u: f64 = rng.gen::<f64>().max(1e-300);
    let v: f64 = rng.gen();
    (-2.0 * u.ln()).sqrt() * (2.0 * std::f64::consts::PI * v).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Observable;
    use crate::space::Distribution;
    use crate::surrogate::{DesignPoint, SurrogateManager};

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

    fn sum_surrogate(space: &ParameterSpace, n: usize) -> Arc<Surrogate> {
        let manager = SurrogateManager::new(space, 1);
        let mut points = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let a = i as f64 / (n - 1) as f64;
                let b = j as f64 / (n - 1) as f64;
                points.push(DesignPoint::new(
                    vec![a, b],
                    Observable::scalar(a + b),
                ));
            }
        }
        manager.append(points).unwrap();
        manager.current()
    }

    #[test]
    fn transform_round_trips() {
        let space = unit_space(3);
        let transform = BoundsTransform::new(&space);
        let theta = vec![0.2, 0.5, 0.9];
        let z = transform.to_unconstrained(&theta);
        let back = transform.to_constrained(&z);
        for (a, b) in theta.iter().zip(&back) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn grad_z_matches_finite_differences() {
        let space = unit_space(2);
        let surrogate = sum_surrogate(&space, 5);
        let observed = ObservedData::new(vec![1.0], vec![0.05]).unwrap();
        let model = PosteriorModel::new(&space, surrogate, &observed);
        assert!(model.supports_gradient());

        let z = vec![0.3, -0.4];
        let (lp, grad) = model.grad_z(&z).unwrap();
        assert!(lp.is_finite());
        let h = 1e-6;
        for d in 0..2 {
            let mut plus = z.clone();
            plus[d] += h;
            let mut minus = z.clone();
            minus[d] -= h;
            let fd = (model.logp_z(&plus) - model.logp_z(&minus)) / (2.0 * h);
            assert!(
                (grad[d] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                "dim {d}: analytic {} vs fd {fd}",
                grad[d]
            );
        }
    }

    #[test]
    fn fixed_seed_reproduces_trace_summary() {
        let space = unit_space(2);
        let surrogate = sum_surrogate(&space, 5);
        // A wide observation noise keeps the posterior smooth enough for a
        // short round; the assertion is about determinism, not accuracy.
        let observed = ObservedData::new(vec![1.0], vec![0.25]).unwrap();
        let config = CalibrationConfig {
            chains: 2,
            tuning_draws: 400,
            sampling_draws: 500,
            ess_threshold: 50.0,
            r_hat_threshold: 1.2,
            divergence_tolerance: 20,
            ..CalibrationConfig::default()
        };
        let cancel = CancelHandle::new();
        let a = sample_posterior(&space, Arc::clone(&surrogate), &observed, &config, 0, &cancel)
            .unwrap()
            .unwrap();
        let b = sample_posterior(&space, surrogate, &observed, &config, 0, &cancel)
            .unwrap()
            .unwrap();
        assert_eq!(a.state, RoundState::Converged);
        assert_eq!(a.kernel, SamplerKernel::Hmc);
        let sa = a.summary();
        let sb = b.summary();
        for ((_, ma), (_, mb)) in sa.iter().zip(&sb) {
            assert!((ma.mean - mb.mean).abs() < 1e-12);
            assert!((ma.std - mb.std).abs() < 1e-12);
        }
    }

    #[test]
    fn degenerate_surrogate_falls_back_to_random_walk() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        let observed = ObservedData::new(vec![1.0], vec![0.05]).unwrap();
        let model = PosteriorModel::new(&space, manager.current(), &observed);
        assert!(!model.supports_gradient());
    }
}
