//! Parameter space: priors, hard bounds, and the registry
//!
//! Each uncertain simulator input is declared once with a prior distribution
//! and hard bounds, validated at registration. The registry is the single
//! source of truth for dimensionality, prior density, and bound checks used
//! by every downstream component.

pub mod design;

use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use statrs::function::erf;

use crate::{Error, Result};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Standard normal CDF.
fn phi(z: f64) -> f64 {
    0.5 * (1.0 + erf::erf(z / std::f64::consts::SQRT_2))
}

/// Standard normal inverse CDF.
fn phi_inv(p: f64) -> f64 {
    std::f64::consts::SQRT_2 * erf::erf_inv(2.0 * p - 1.0)
}

/// Standard normal density.
fn phi_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Prior distribution over one parameter, validated once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Gaussian prior
    Normal {
        /// Mean
        mean: f64,
        /// Standard deviation (> 0)
        std: f64,
    },
    /// Log-normal prior (support x > 0)
    LogNormal {
        /// Mean of ln(x)
        location: f64,
        /// Standard deviation of ln(x) (> 0)
        scale: f64,
    },
    /// Uniform prior on [low, high]
    Uniform {
        /// Lower edge
        low: f64,
        /// Upper edge (> low)
        high: f64,
    },
    /// Gaussian prior truncated to [low, high]
    TruncatedNormal {
        /// Mean of the untruncated Gaussian
        mean: f64,
        /// Standard deviation of the untruncated Gaussian (> 0)
        std: f64,
        /// Lower truncation point
        low: f64,
        /// Upper truncation point (> low)
        high: f64,
    },
}

impl Distribution {
    /// Check hyperparameters against the distribution kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on non-finite hyperparameters,
    /// non-positive scale, or inverted interval edges.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::Configuration(msg));
        match *self {
            Self::Normal { mean, std } => {
                if !mean.is_finite() || !std.is_finite() || std <= 0.0 {
                    return bad(format!(
                        "Normal prior requires finite mean and std > 0, got mean={mean}, std={std}"
                    ));
                }
            }
            Self::LogNormal { location, scale } => {
                if !location.is_finite() || !scale.is_finite() || scale <= 0.0 {
                    return bad(format!(
                        "LogNormal prior requires finite location and scale > 0, \
                         got location={location}, scale={scale}"
                    ));
                }
            }
            Self::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return bad(format!(
                        "Uniform prior requires finite low < high, got [{low}, {high}]"
                    ));
                }
            }
            Self::TruncatedNormal {
                mean,
                std,
                low,
                high,
            } => {
                if !mean.is_finite() || !std.is_finite() || std <= 0.0 {
                    return bad(format!(
                        "TruncatedNormal prior requires finite mean and std > 0, \
                         got mean={mean}, std={std}"
                    ));
                }
                if !low.is_finite() || !high.is_finite() || low >= high {
                    return bad(format!(
                        "TruncatedNormal prior requires finite low < high, got [{low}, {high}]"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Support of the density as a (possibly infinite) interval.
    #[must_use]
    pub fn support(&self) -> (f64, f64) {
        match *self {
            Self::Normal { .. } => (f64::NEG_INFINITY, f64::INFINITY),
            Self::LogNormal { .. } => (0.0, f64::INFINITY),
            Self::Uniform { low, high } | Self::TruncatedNormal { low, high, .. } => (low, high),
        }
    }

    /// Log density at `x` (`-inf` outside the support).
    #[must_use]
    pub fn ln_pdf(&self, x: f64) -> f64 {
        match *self {
            Self::Normal { mean, std } => {
                let z = (x - mean) / std;
                -LN_SQRT_2PI - std.ln() - 0.5 * z * z
            }
            Self::LogNormal { location, scale } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let z = (x.ln() - location) / scale;
                -x.ln() - scale.ln() - LN_SQRT_2PI - 0.5 * z * z
            }
            Self::Uniform { low, high } => {
                if x < low || x > high {
                    f64::NEG_INFINITY
                } else {
                    -(high - low).ln()
                }
            }
            Self::TruncatedNormal {
                mean,
                std,
                low,
                high,
            } => {
                if x < low || x > high {
                    return f64::NEG_INFINITY;
                }
                let z = (x - mean) / std;
                let mass = phi((high - mean) / std) - phi((low - mean) / std);
                -LN_SQRT_2PI - std.ln() - 0.5 * z * z - mass.ln()
            }
        }
    }

    /// Derivative of the log density at `x` (0 outside the support; the
    /// sampler never evaluates gradients there).
    #[must_use]
    pub fn ln_pdf_grad(&self, x: f64) -> f64 {
        match *self {
            Self::Normal { mean, std } | Self::TruncatedNormal { mean, std, .. } => {
                -(x - mean) / (std * std)
            }
            Self::LogNormal { location, scale } => {
                if x <= 0.0 {
                    0.0
                } else {
                    -(1.0 + (x.ln() - location) / (scale * scale)) / x
                }
            }
            Self::Uniform { .. } => 0.0,
        }
    }

    /// Cumulative distribution function at `x`.
    #[must_use]
    pub fn cdf(&self, x: f64) -> f64 {
        match *self {
            Self::Normal { mean, std } => phi((x - mean) / std),
            Self::LogNormal { location, scale } => {
                if x <= 0.0 {
                    0.0
                } else {
                    phi((x.ln() - location) / scale)
                }
            }
            Self::Uniform { low, high } => ((x - low) / (high - low)).clamp(0.0, 1.0),
            Self::TruncatedNormal {
                mean,
                std,
                low,
                high,
            } => {
                let p_low = phi((low - mean) / std);
                let p_high = phi((high - mean) / std);
                (((phi((x - mean) / std)) - p_low) / (p_high - p_low)).clamp(0.0, 1.0)
            }
        }
    }

    /// Quantile function for `p` in `[0, 1]`.
    #[must_use]
    pub fn inverse_cdf(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        match *self {
            Self::Normal { mean, std } => mean + std * phi_inv(p),
            Self::LogNormal { location, scale } => (location + scale * phi_inv(p)).exp(),
            Self::Uniform { low, high } => low + p * (high - low),
            Self::TruncatedNormal {
                mean,
                std,
                low,
                high,
            } => {
                let p_low = phi((low - mean) / std);
                let p_high = phi((high - mean) / std);
                let x = mean + std * phi_inv(p_low + p * (p_high - p_low));
                x.clamp(low, high)
            }
        }
    }

    /// Prior mean (used for degenerate-surrogate fallbacks and reporting).
    #[must_use]
    pub fn mean(&self) -> f64 {
        match *self {
            Self::Normal { mean, .. } => mean,
            Self::LogNormal { location, scale } => (location + 0.5 * scale * scale).exp(),
            Self::Uniform { low, high } => 0.5 * (low + high),
            Self::TruncatedNormal {
                mean,
                std,
                low,
                high,
            } => {
                let z_low = (low - mean) / std;
                let z_high = (high - mean) / std;
                let mass = phi(z_high) - phi(z_low);
                mean + std * (phi_pdf(z_low) - phi_pdf(z_high)) / mass
            }
        }
    }
}

/// Posterior summary for one parameter after a completed sampling round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginalSummary {
    /// Posterior mean
    pub mean: f64,
    /// Posterior standard deviation
    pub std: f64,
    /// Lower edge of the 90% equal-tailed credible interval
    pub ci_lower: f64,
    /// Upper edge of the 90% equal-tailed credible interval
    pub ci_upper: f64,
}

/// One calibration parameter: prior, hard bounds, and the latest posterior
/// summary. Created at session configuration; never removed mid-session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    distribution: Distribution,
    bounds: (f64, f64),
    posterior: Option<MarginalSummary>,
}

impl Parameter {
    /// Parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prior distribution.
    #[must_use]
    pub const fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Hard bounds `(low, high)`.
    #[must_use]
    pub const fn bounds(&self) -> (f64, f64) {
        self.bounds
    }

    /// Latest posterior summary, if a sampling round has completed.
    #[must_use]
    pub const fn posterior(&self) -> Option<MarginalSummary> {
        self.posterior
    }
}

/// Registry of calibration parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSpace {
    params: Vec<Parameter>,
    #[serde(skip)]
    index: FxHashMap<String, usize>,
}

impl ParameterSpace {
    /// Create an empty space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with its prior and hard bounds.
    ///
    /// Bounds must be finite, ordered, carry nonzero prior mass, and lie
    /// inside the prior's support.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on invalid hyperparameters, invalid
    /// bounds, or a duplicate name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        distribution: Distribution,
        bounds: (f64, f64),
    ) -> Result<()> {
        let name = name.into();
        distribution.validate()?;
        let (low, high) = bounds;
        if !low.is_finite() || !high.is_finite() || low >= high {
            return Err(Error::Configuration(format!(
                "parameter '{name}': bounds must be finite with low < high, got [{low}, {high}]"
            )));
        }
        let (support_low, support_high) = distribution.support();
        if high <= support_low || low >= support_high {
            return Err(Error::Configuration(format!(
                "parameter '{name}': bounds [{low}, {high}] lie outside the prior support"
            )));
        }
        let mass = distribution.cdf(high) - distribution.cdf(low);
        if mass <= 0.0 {
            return Err(Error::Configuration(format!(
                "parameter '{name}': prior assigns zero mass to bounds [{low}, {high}]"
            )));
        }
        if self.index.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "parameter '{name}' is already registered"
            )));
        }
        self.index.insert(name.clone(), self.params.len());
        self.params.push(Parameter {
            name,
            distribution,
            bounds,
            posterior: None,
        });
        Ok(())
    }

    /// Number of parameters.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.params.len()
    }

    /// All registered parameters, in registration order.
    #[must_use]
    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Look up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Hard bounds per dimension, in registration order.
    #[must_use]
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.params.iter().map(|p| p.bounds).collect()
    }

    /// True when every component of `theta` lies within its hard bounds.
    #[must_use]
    pub fn contains(&self, theta: &[f64]) -> bool {
        theta.len() == self.params.len()
            && theta
                .iter()
                .zip(&self.params)
                .all(|(&x, p)| x >= p.bounds.0 && x <= p.bounds.1)
    }

    /// Joint log prior density at `theta` (`-inf` outside bounds).
    #[must_use]
    pub fn log_prior(&self, theta: &[f64]) -> f64 {
        if !self.contains(theta) {
            return f64::NEG_INFINITY;
        }
        theta
            .iter()
            .zip(&self.params)
            .map(|(&x, p)| p.distribution.ln_pdf(x))
            .sum()
    }

    /// Draw one vector from the prior, restricted to the hard bounds
    /// (exact bound-truncated draw via the quantile function).
    pub fn sample_prior(&self, rng: &mut StdRng) -> Vec<f64> {
        self.params
            .iter()
            .map(|p| {
                let (low, high) = p.bounds;
                let p_low = p.distribution.cdf(low);
                let p_high = p.distribution.cdf(high);
                let u: f64 = rng.gen();
                p.distribution
                    .inverse_cdf(p_low + u * (p_high - p_low))
                    .clamp(low, high)
            })
            .collect()
    }

    /// Store the posterior summary for a parameter after a completed round.
    pub fn update_posterior(&mut self, name: &str, summary: MarginalSummary) {
        if let Some(&i) = self.index.get(name) {
            self.params[i].posterior = Some(summary);
        }
    }

    /// Rebuild the name index (needed after deserialization).
    pub fn rebuild_index(&mut self) {
        self.index = self
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn three_param_space() -> ParameterSpace {
        let mut space = ParameterSpace::new();
        space
            .register(
                "building_scale",
                Distribution::Uniform {
                    low: 3.0,
                    high: 7.0,
                },
                (3.0, 7.0),
            )
            .unwrap();
        space
            .register(
                "infiltration_mult",
                Distribution::TruncatedNormal {
                    mean: 1.0,
                    std: 0.4,
                    low: 0.5,
                    high: 2.0,
                },
                (0.5, 2.0),
            )
            .unwrap();
        space
            .register(
                "plug_load_mult",
                Distribution::Normal {
                    mean: 1.1,
                    std: 0.2,
                },
                (0.8, 1.5),
            )
            .unwrap();
        space
    }

    #[test]
    fn negative_std_is_configuration_error() {
        let dist = Distribution::Normal {
            mean: 0.0,
            std: -1.0,
        };
        assert!(matches!(dist.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut space = ParameterSpace::new();
        let dist = Distribution::Uniform {
            low: 0.0,
            high: 1.0,
        };
        space.register("x", dist, (0.0, 1.0)).unwrap();
        assert!(space.register("x", dist, (0.0, 1.0)).is_err());
    }

    #[test]
    fn bounds_outside_support_rejected() {
        let mut space = ParameterSpace::new();
        let dist = Distribution::LogNormal {
            location: 0.0,
            scale: 1.0,
        };
        assert!(space.register("neg", dist, (-2.0, -1.0)).is_err());
    }

    #[test]
    fn log_prior_is_neg_inf_out_of_bounds() {
        let space = three_param_space();
        assert_eq!(space.log_prior(&[10.0, 1.0, 1.0]), f64::NEG_INFINITY);
        assert!(space.log_prior(&[5.0, 1.0, 1.1]).is_finite());
    }

    #[test]
    fn prior_draws_respect_bounds() {
        let space = three_param_space();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let theta = space.sample_prior(&mut rng);
            assert!(space.contains(&theta), "out-of-bounds draw: {theta:?}");
        }
    }

    #[test]
    fn quantile_round_trip() {
        let dists = [
            Distribution::Normal {
                mean: 2.0,
                std: 0.5,
            },
            Distribution::LogNormal {
                location: 0.1,
                scale: 0.3,
            },
            Distribution::Uniform {
                low: -1.0,
                high: 4.0,
            },
            Distribution::TruncatedNormal {
                mean: 0.0,
                std: 1.0,
                low: -1.5,
                high: 2.0,
            },
        ];
        for dist in dists {
            for p in [0.05, 0.25, 0.5, 0.75, 0.95] {
                let x = dist.inverse_cdf(p);
                assert!(
                    (dist.cdf(x) - p).abs() < 1e-8,
                    "{dist:?} quantile round-trip failed at p={p}"
                );
            }
        }
    }

    #[test]
    fn truncated_normal_mean_between_bounds() {
        let dist = Distribution::TruncatedNormal {
            mean: 0.0,
            std: 1.0,
            low: 1.0,
            high: 3.0,
        };
        let m = dist.mean();
        assert!(m > 1.0 && m < 3.0);
    }

    #[test]
    fn space_round_trips_through_json() {
        let space = three_param_space();
        let json = serde_json::to_string(&space).unwrap();
        let mut back: ParameterSpace = serde_json::from_str(&json).unwrap();
        back.rebuild_index();
        assert_eq!(back.dim(), 3);
        assert!(back.get("plug_load_mult").is_some());
    }
}
