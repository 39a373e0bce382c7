//! MCMC convergence diagnostics
//!
//! Split R-hat and autocorrelation-based effective sample size, computed
//! per parameter across all chains (Gelman et al., Bayesian Data Analysis,
//! 3rd ed.). A trace is only valid when every parameter passes every
//! criterion; failures carry the observed value and the threshold.

use serde::{Deserialize, Serialize};

use crate::error::ConvergenceDetail;
use crate::CalibrationConfig;

/// Diagnostics for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDiagnostics {
    /// Parameter name
    pub name: String,
    /// Split Gelman-Rubin statistic
    pub r_hat: f64,
    /// Effective sample size across all chains
    pub ess: f64,
}

/// Diagnostics for one sampling round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Per-parameter statistics, in registration order
    pub per_param: Vec<ParamDiagnostics>,
    /// Divergent transitions observed after tuning
    pub divergences: usize,
}

impl Diagnostics {
    /// Compute diagnostics from per-chain draws.
    ///
    /// `chains[c][i][d]` is draw `i` of chain `c`, component `d`.
    #[must_use]
    pub fn compute(names: &[String], chains: &[Vec<Vec<f64>>], divergences: usize) -> Self {
        let per_param = names
            .iter()
            .enumerate()
            .map(|(d, name)| {
                let series: Vec<Vec<f64>> = chains
                    .iter()
                    .map(|chain| chain.iter().map(|draw| draw[d]).collect())
                    .collect();
                ParamDiagnostics {
                    name: name.clone(),
                    r_hat: split_r_hat(&series),
                    ess: effective_sample_size(&series),
                }
            })
            .collect();
        Self {
            per_param,
            divergences,
        }
    }

    /// Check every criterion, returning the full list of violations.
    ///
    /// # Errors
    ///
    /// Returns the violations when any parameter fails R-hat, ESS, or the
    /// round exceeds the divergence tolerance.
    pub fn check(&self, config: &CalibrationConfig) -> Result<(), Vec<ConvergenceDetail>> {
        let mut failures = Vec::new();
        for p in &self.per_param {
            if !(p.r_hat < config.r_hat_threshold) {
                failures.push(ConvergenceDetail {
                    parameter: p.name.clone(),
                    criterion: "r_hat",
                    observed: p.r_hat,
                    threshold: config.r_hat_threshold,
                });
            }
            if !(p.ess > config.ess_threshold) {
                failures.push(ConvergenceDetail {
                    parameter: p.name.clone(),
                    criterion: "ess",
                    observed: p.ess,
                    threshold: config.ess_threshold,
                });
            }
        }
        if self.divergences > config.divergence_tolerance {
            failures.push(ConvergenceDetail {
                parameter: "(all)".to_string(),
                criterion: "divergences",
                observed: self.divergences as f64,
                threshold: config.divergence_tolerance as f64,
            });
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }
}

/// Split R-hat: each chain is halved, then within/between variance compared.
#[must_use]
pub fn split_r_hat(chains: &[Vec<f64>]) -> f64 {
    let Some(shortest) = chains.iter().map(Vec::len).min() else {
        return f64::INFINITY;
    };
    let half = shortest / 2;
    if chains.len() < 2 || half < 2 {
        return f64::INFINITY;
    }

    let split: Vec<&[f64]> = chains
        .iter()
        .flat_map(|chain| [&chain[..half], &chain[half..2 * half]])
        .collect();
    let m = split.len() as f64;
    let n = half as f64;

    let means: Vec<f64> = split
        .iter()
        .map(|c| c.iter().sum::<f64>() / n)
        .collect();
    let grand = means.iter().sum::<f64>() / m;
    let b = n / (m - 1.0) * means.iter().map(|&mu| (mu - grand).powi(2)).sum::<f64>();
    let w = split
        .iter()
        .zip(&means)
        .map(|(c, &mu)| c.iter().map(|&x| (x - mu).powi(2)).sum::<f64>() / (n - 1.0))
        .sum::<f64>()
        / m;
    if w <= 0.0 {
        // All chains constant: identical constants are trivially converged.
        return if b <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (n - 1.0) / n * w + b / n;
    (var_plus / w).sqrt()
}

/// ESS via chain-averaged autocorrelation with truncation at the first
/// negative lag (initial positive sequence estimator).
#[must_use]
pub fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let Some(shortest) = chains.iter().map(Vec::len).min() else {
        return 0.0;
    };
    if shortest < 10 {
        return 0.0;
    }
    let n_total = chains.iter().map(Vec::len).sum::<usize>() as f64;
    let max_lag = (shortest / 2).min(200);

    let mut avg = vec![0.0; max_lag];
    for chain in chains {
        let rho = autocorrelation(&chain[..shortest], max_lag);
        for (a, r) in avg.iter_mut().zip(rho) {
            *a += r / chains.len() as f64;
        }
    }

    let mut tail = 0.0;
    for &rho in avg.iter().skip(1) {
        if rho <= 0.0 {
            break;
        }
        tail += rho;
    }
    n_total / (1.0 + 2.0 * tail)
}

fn autocorrelation(series: &[f64], max_lag: usize) -> Vec<f64> {
    let n = series.len();
    let mean = series.iter().sum::<f64>() / n as f64;
    let var = series.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    if var <= 0.0 {
        return vec![0.0; max_lag];
    }
    (0..max_lag)
        .map(|lag| {
            let cov: f64 = series[..n - lag]
                .iter()
                .zip(&series[lag..])
                .map(|(&a, &b)| (a - mean) * (b - mean))
                .sum::<f64>()
                / n as f64;
            cov / var
        })
        .collect()
}
