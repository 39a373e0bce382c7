//! Space-filling initial designs
//!
//! Latin hypercube sampling is the canonical initial design: each dimension
//! is split into `n` strata, each stratum sampled exactly once, and the
//! stratum order permuted independently per dimension. A full-factorial grid
//! is kept as the degraded brute-force fallback from earlier workflows; it
//! is never selected by the engine itself.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ParameterSpace;
use crate::{Error, Result};

/// How each dimension's support is stratified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrataMode {
    /// Strata of equal prior probability mass (quantile-mapped)
    EqualProbability,
    /// Strata of equal width between the hard bounds
    EqualWidth,
}

/// Generate `n` Latin hypercube points within the hard bounds.
///
/// Every dimension is cut into `n` strata; each stratum is sampled exactly
/// once and the per-dimension stratum assignment is an independent random
/// permutation, so no two points share a stratum in any dimension.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when the space is empty or
/// `n < max(2, dim + 1)`.
pub fn latin_hypercube(
    space: &ParameterSpace,
    n: usize,
    mode: StrataMode,
    rng: &mut StdRng,
) -> Result<Vec<Vec<f64>>> {
    let dim = space.dim();
    if dim == 0 {
        return Err(Error::Configuration(
            "cannot generate a design for an empty parameter space".to_string(),
        ));
    }
    let minimum = 2.max(dim + 1);
    if n < minimum {
        return Err(Error::Configuration(format!(
            "initial design needs at least {minimum} points for {dim} parameters, got {n}"
        )));
    }

    // One permutation of stratum indices per dimension.
    let mut strata: Vec<Vec<usize>> = Vec::with_capacity(dim);
    for _ in 0..dim {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        strata.push(order);
    }

    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        let mut theta = Vec::with_capacity(dim);
        for (d, param) in space.params().iter().enumerate() {
            let stratum = strata[d][i];
            let u: f64 = rng.gen();
            let frac = (stratum as f64 + u) / n as f64;
            let (low, high) = param.bounds();
            let x = match mode {
                StrataMode::EqualWidth => low + frac * (high - low),
                StrataMode::EqualProbability => {
                    let dist = param.distribution();
                    let p_low = dist.cdf(low);
                    let p_high = dist.cdf(high);
                    dist.inverse_cdf(p_low + frac * (p_high - p_low))
                }
            };
            theta.push(x.clamp(low, high));
        }
        points.push(theta);
    }
    Ok(points)
}

/// Full-factorial grid over cell centers: `points_per_dim^dim` vectors.
///
/// Brute-force fallback only; cost explodes exponentially with dimension.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when `points_per_dim < 2` or the grid
/// would exceed one million points.
pub fn full_factorial_grid(space: &ParameterSpace, points_per_dim: usize) -> Result<Vec<Vec<f64>>> {
    let dim = space.dim();
    if dim == 0 {
        return Err(Error::Configuration(
            "cannot generate a grid for an empty parameter space".to_string(),
        ));
    }
    if points_per_dim < 2 {
        return Err(Error::Configuration(format!(
            "grid needs at least 2 points per dimension, got {points_per_dim}"
        )));
    }
    let total = points_per_dim.checked_pow(dim as u32).ok_or_else(|| {
        Error::Configuration(format!(
            "grid of {points_per_dim}^{dim} points overflows"
        ))
    })?;
    if total > 1_000_000 {
        return Err(Error::Configuration(format!(
            "grid of {points_per_dim}^{dim} = {total} points exceeds the 1M cap"
        )));
    }

    let axes: Vec<Vec<f64>> = space
        .params()
        .iter()
        .map(|p| {
            let (low, high) = p.bounds();
            let width = (high - low) / points_per_dim as f64;
            (0..points_per_dim)
                .map(|j| low + (j as f64 + 0.5) * width)
                .collect()
        })
        .collect();

    let mut points = Vec::with_capacity(total);
    let mut idx = vec![0usize; dim];
    loop {
        points.push((0..dim).map(|d| axes[d][idx[d]]).collect());
        // Odometer increment over the index vector.
        let mut d = 0;
        loop {
            idx[d] += 1;
            if idx[d] < points_per_dim {
                break;
            }
            idx[d] = 0;
            d += 1;
            if d == dim {
                return Ok(points);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Distribution;
    use rand::SeedableRng;

    fn unit_cube(dim: usize) -> ParameterSpace {
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

    #[test]
    fn rejects_undersized_design() {
        let space = unit_cube(3);
        let mut rng = StdRng::seed_from_u64(1);
        let err = latin_hypercube(&space, 3, StrataMode::EqualWidth, &mut rng);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn each_dimension_occupies_distinct_strata() {
        let space = unit_cube(3);
        let mut rng = StdRng::seed_from_u64(9);
        let n = 16;
        let points = latin_hypercube(&space, n, StrataMode::EqualWidth, &mut rng).unwrap();
        for d in 0..3 {
            let mut seen = vec![false; n];
            for point in &points {
                let stratum = ((point[d] * n as f64) as usize).min(n - 1);
                assert!(!seen[stratum], "dimension {d} reuses stratum {stratum}");
                seen[stratum] = true;
            }
        }
    }

    #[test]
    fn equal_probability_mode_respects_bounds() {
        let mut space = ParameterSpace::new();
        space
            .register(
                "infil",
                Distribution::Normal {
                    mean: 1.0,
                    std: 0.5,
                },
                (0.5, 2.0),
            )
            .unwrap();
        space
            .register(
                "plug",
                Distribution::LogNormal {
                    location: 0.0,
                    scale: 0.25,
                },
                (0.8, 1.5),
            )
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let points = latin_hypercube(&space, 24, StrataMode::EqualProbability, &mut rng).unwrap();
        for point in &points {
            assert!(space.contains(point), "out of bounds: {point:?}");
        }
    }

    #[test]
    fn grid_has_expected_cardinality_and_bounds() {
        let space = unit_cube(3);
        let points = full_factorial_grid(&space, 4).unwrap();
        assert_eq!(points.len(), 64);
        for point in &points {
            assert!(space.contains(point));
        }
    }

    #[test]
    fn fixed_seed_reproduces_design() {
        let space = unit_cube(2);
        let mut rng_a = StdRng::seed_from_u64(11);
        let mut rng_b = StdRng::seed_from_u64(11);
        let a = latin_hypercube(&space, 8, StrataMode::EqualWidth, &mut rng_a).unwrap();
        let b = latin_hypercube(&space, 8, StrataMode::EqualWidth, &mut rng_b).unwrap();
        assert_eq!(a, b);
    }
}
