//! Gaussian-process regression internals
//!
//! One squared-exponential GP per output component over jointly standardized
//! inputs, fitted via Cholesky decomposition. The nugget is chosen from a
//! small geometric grid by leave-one-out cross-validation, which guards
//! against both interpolation of noise and over-smoothing. Predictive
//! variance relaxes to the prior signal variance away from the data, so
//! extrapolation is always reported as uncertain.

use nalgebra::{DMatrix, DVector};

/// Nugget candidates for the LOO-CV grid search.
const NUGGET_GRID: [f64; 4] = [1e-8, 1e-6, 1e-4, 1e-2];

/// Floor applied to standard deviations to avoid division blow-ups on
/// constant columns.
const STD_FLOOR: f64 = 1e-12;

/// Per-dimension affine transform to zero mean, unit variance.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardizer {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Standardizer {
    /// Fit the transform on raw input rows.
    #[must_use]
    pub fn fit(rows: &[Vec<f64>], dim: usize) -> Self {
        let n = rows.len().max(1) as f64;
        let mut means = vec![0.0; dim];
        for row in rows {
            for (d, &x) in row.iter().enumerate() {
                means[d] += x / n;
            }
        }
        let mut stds = vec![0.0; dim];
        for row in rows {
            for (d, &x) in row.iter().enumerate() {
                stds[d] += (x - means[d]).powi(2) / n;
            }
        }
        for s in &mut stds {
            *s = s.sqrt().max(STD_FLOOR);
        }
        Self { means, stds }
    }

    /// Transform one raw vector into standardized space.
    #[must_use]
    pub fn transform(&self, theta: &[f64]) -> Vec<f64> {
        theta
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(&x, (&m, &s))| (x - m) / s)
            .collect()
    }

    /// Standard deviation of input dimension `d` (chain-rule helper for
    /// gradients taken with respect to raw inputs).
    #[must_use]
    pub fn input_std(&self, d: usize) -> f64 {
        self.stds[d]
    }

    /// Euclidean distance between two raw vectors in standardized space.
    #[must_use]
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .zip(&self.stds)
            .map(|((&x, &y), &s)| ((x - y) / s).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// How one output component was transformed before fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTransform {
    /// Fit on raw values
    Identity,
    /// Fit on ln(values); applied when outputs are strictly positive and
    /// right-skewed
    Log,
}

impl OutputTransform {
    /// Pick the transform for one output column.
    ///
    /// Log is chosen when every value is strictly positive and the sample
    /// skewness is clearly right-tailed.
    #[must_use]
    pub fn select(ys: &[f64]) -> Self {
        if ys.iter().any(|&y| y <= 0.0) || ys.len() < 3 {
            return Self::Identity;
        }
        let n = ys.len() as f64;
        let mean = ys.iter().sum::<f64>() / n;
        let var = ys.iter().map(|&y| (y - mean).powi(2)).sum::<f64>() / n;
        if var <= 0.0 {
            return Self::Identity;
        }
        let skew = ys.iter().map(|&y| (y - mean).powi(3)).sum::<f64>() / (n * var.powf(1.5));
        if skew > 1.0 {
            Self::Log
        } else {
            Self::Identity
        }
    }

    fn forward(self, y: f64) -> f64 {
        match self {
            Self::Identity => y,
            Self::Log => y.ln(),
        }
    }
}

/// Fitted GP for a single output component.
///
/// Inputs are already standardized; `y` is additionally centered/scaled
/// internally so the unit signal variance assumption holds.
#[derive(Debug, Clone)]
pub struct GpOutput {
    transform: OutputTransform,
    y_mean: f64,
    y_std: f64,
    x_train: Vec<Vec<f64>>,
    /// (K + nugget I)^-1 y, standardized
    alpha: DVector<f64>,
    /// Lower Cholesky factor of K + nugget I
    l_factor: DMatrix<f64>,
    nugget: f64,
    /// LOO-CV RMSE in transformed, standardized units
    loo_rmse: f64,
}

fn kernel(a: &[f64], b: &[f64]) -> f64 {
    let sq: f64 = a.iter().zip(b).map(|(&x, &y)| (x - y).powi(2)).sum();
    (-0.5 * sq).exp()
}

fn kernel_matrix(x: &[Vec<f64>], nugget: f64) -> DMatrix<f64> {
    let n = x.len();
    DMatrix::from_fn(n, n, |i, j| {
        let k = kernel(&x[i], &x[j]);
        if i == j {
            k + nugget
        } else {
            k
        }
    })
}

/// LOO-CV RMSE from the closed form: residual_i = alpha_i / [K^-1]_ii.
fn loo_cv_rmse(k_inv: &DMatrix<f64>, alpha: &DVector<f64>) -> f64 {
    let n = alpha.len();
    let mut sum_sq = 0.0;
    for i in 0..n {
        let diag = k_inv[(i, i)].max(STD_FLOOR);
        let residual = alpha[i] / diag;
        sum_sq += residual * residual;
    }
    (sum_sq / n as f64).sqrt()
}

impl GpOutput {
    /// Fit one output column against standardized inputs.
    ///
    /// Returns `None` when the Cholesky factorization fails for every
    /// nugget candidate (degenerate training geometry).
    #[must_use]
    pub fn fit(x_std: &[Vec<f64>], ys_raw: &[f64]) -> Option<Self> {
        let transform = OutputTransform::select(ys_raw);
        let ys: Vec<f64> = ys_raw.iter().map(|&y| transform.forward(y)).collect();
        let n = ys.len() as f64;
        let y_mean = ys.iter().sum::<f64>() / n;
        let y_std = (ys.iter().map(|&y| (y - y_mean).powi(2)).sum::<f64>() / n)
            .sqrt()
            .max(STD_FLOOR);
        let y_vec = DVector::from_iterator(ys.len(), ys.iter().map(|&y| (y - y_mean) / y_std));

        let mut best: Option<(f64, f64, DMatrix<f64>, DVector<f64>)> = None;
        for &nugget in &NUGGET_GRID {
            let k = kernel_matrix(x_std, nugget);
            let Some(chol) = k.clone().cholesky() else {
                continue;
            };
            let alpha = chol.solve(&y_vec);
            let k_inv = chol.inverse();
            let rmse = loo_cv_rmse(&k_inv, &alpha);
            let is_better = best.as_ref().map_or(true, |(_, r, _, _)| rmse < *r);
            if is_better {
                best = Some((nugget, rmse, chol.l(), alpha));
            }
        }
        let (nugget, loo_rmse, l_factor, alpha) = best?;
        Some(Self {
            transform,
            y_mean,
            y_std,
            x_train: x_std.to_vec(),
            alpha,
            l_factor,
            nugget,
            loo_rmse,
        })
    }

    fn cross_kernel(&self, x_std: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.x_train.len(),
            self.x_train.iter().map(|xi| kernel(xi, x_std)),
        )
    }

    /// Solve L L^T beta = k_star using the stored factor.
    fn solve_k(&self, k_star: &DVector<f64>) -> DVector<f64> {
        let mut v = k_star.clone();
        let _ = self.l_factor.solve_lower_triangular_mut(&mut v);
        let mut beta = v;
        let _ = self
            .l_factor
            .transpose()
            .solve_upper_triangular_mut(&mut beta);
        beta
    }

    /// Predict (mean, variance) at a standardized input, in original units.
    #[must_use]
    pub fn predict(&self, x_std: &[f64]) -> (f64, f64) {
        let k_star = self.cross_kernel(x_std);
        let mut v = k_star.clone();
        let _ = self.l_factor.solve_lower_triangular_mut(&mut v);
        let mean_s = self.alpha.dot(&k_star);
        // Prior variance is 1 in standardized units; far from data the
        // reduction term vanishes and the prediction is maximally uncertain.
        let var_s = (1.0 - v.dot(&v)).max(self.nugget);

        let mu = self.y_mean + self.y_std * mean_s;
        let sigma2 = self.y_std * self.y_std * var_s;
        match self.transform {
            OutputTransform::Identity => (mu, sigma2),
            OutputTransform::Log => {
                // (mu, sigma2) describe ln(y); convert to original space.
                let mean = (mu + 0.5 * sigma2).exp();
                let var = (sigma2.exp() - 1.0) * (2.0 * mu + sigma2).exp();
                (mean, var)
            }
        }
    }

    /// Analytic gradients of predictive mean and variance with respect to
    /// the standardized input. `None` when the output was log-transformed
    /// (the sampler then falls back to a gradient-free kernel).
    #[must_use]
    pub fn gradient(&self, x_std: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
        if self.transform == OutputTransform::Log {
            return None;
        }
        let dim = x_std.len();
        let k_star = self.cross_kernel(x_std);
        let beta = self.solve_k(&k_star);
        let mut dmean = vec![0.0; dim];
        let mut dvar = vec![0.0; dim];
        for (i, xi) in self.x_train.iter().enumerate() {
            for d in 0..dim {
                // d/dx_d of exp(-0.5 |x - xi|^2) = -(x_d - xi_d) * k
                let dk = -(x_std[d] - xi[d]) * k_star[i];
                dmean[d] += self.alpha[i] * dk;
                dvar[d] += -2.0 * beta[i] * dk;
            }
        }
        let scale = self.y_std;
        for d in 0..dim {
            dmean[d] *= scale;
            dvar[d] *= scale * scale;
        }
        Some((dmean, dvar))
    }

    /// LOO-CV RMSE in original output units (transformed scale for Log).
    #[must_use]
    pub fn loo_rmse(&self) -> f64 {
        self.loo_rmse * self.y_std
    }

    /// Selected nugget (exposed for diagnostics).
    #[must_use]
    pub const fn nugget(&self) -> f64 {
        self.nugget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_2d() -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                let a = f64::from(i) / 4.0;
                let b = f64::from(j) / 4.0;
                xs.push(vec![a, b]);
                ys.push(a + 2.0 * b);
            }
        }
        (xs, ys)
    }

    #[test]
    fn interpolates_linear_function() {
        let (xs, ys) = grid_2d();
        let std = Standardizer::fit(&xs, 2);
        let x_std: Vec<Vec<f64>> = xs.iter().map(|x| std.transform(x)).collect();
        let gp = GpOutput::fit(&x_std, &ys).unwrap();
        let (mean, var) = gp.predict(&std.transform(&[0.4, 0.6]));
        assert!((mean - (0.4 + 1.2)).abs() < 0.05, "mean was {mean}");
        assert!(var >= 0.0);
    }

    #[test]
    fn variance_grows_under_extrapolation() {
        let (xs, ys) = grid_2d();
        let std = Standardizer::fit(&xs, 2);
        let x_std: Vec<Vec<f64>> = xs.iter().map(|x| std.transform(x)).collect();
        let gp = GpOutput::fit(&x_std, &ys).unwrap();
        let (_, var_inside) = gp.predict(&std.transform(&[0.5, 0.5]));
        let (_, var_far) = gp.predict(&std.transform(&[8.0, -7.0]));
        assert!(
            var_far > 10.0 * var_inside.max(1e-9),
            "far {var_far} vs inside {var_inside}"
        );
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (xs, ys) = grid_2d();
        let std = Standardizer::fit(&xs, 2);
        let x_std: Vec<Vec<f64>> = xs.iter().map(|x| std.transform(x)).collect();
        let gp = GpOutput::fit(&x_std, &ys).unwrap();

        let q = std.transform(&[0.35, 0.55]);
        let (dmean, dvar) = gp.gradient(&q).unwrap();
        let h = 1e-5;
        for d in 0..2 {
            let mut plus = q.clone();
            plus[d] += h;
            let mut minus = q.clone();
            minus[d] -= h;
            let (mp, vp) = gp.predict(&plus);
            let (mm, vm) = gp.predict(&minus);
            let fd_mean = (mp - mm) / (2.0 * h);
            let fd_var = (vp - vm) / (2.0 * h);
            assert!(
                (dmean[d] - fd_mean).abs() < 1e-3 * (1.0 + fd_mean.abs()),
                "dim {d}: analytic {} vs fd {fd_mean}",
                dmean[d]
            );
            assert!(
                (dvar[d] - fd_var).abs() < 1e-3 * (1.0 + fd_var.abs()),
                "dim {d}: analytic {} vs fd {fd_var}",
                dvar[d]
            );
        }
    }

    #[test]
    fn log_transform_selected_for_skewed_positive_outputs() {
        // Heavy right tail, strictly positive.
        let ys: Vec<f64> = (0..20)
            .map(|i| if i == 19 { 500.0 } else { 1.0 + f64::from(i) * 0.1 })
            .collect();
        assert_eq!(OutputTransform::select(&ys), OutputTransform::Log);
        let with_zero = vec![0.0, 1.0, 2.0, 100.0];
        assert_eq!(OutputTransform::select(&with_zero), OutputTransform::Identity);
    }

    #[test]
    fn refit_is_idempotent() {
        let (xs, ys) = grid_2d();
        let std = Standardizer::fit(&xs, 2);
        let x_std: Vec<Vec<f64>> = xs.iter().map(|x| std.transform(x)).collect();
        let gp_a = GpOutput::fit(&x_std, &ys).unwrap();
        let gp_b = GpOutput::fit(&x_std, &ys).unwrap();
        for q in [[0.1, 0.9], [0.5, 0.2], [0.8, 0.8]] {
            let (ma, va) = gp_a.predict(&std.transform(&q));
            let (mb, vb) = gp_b.predict(&std.transform(&q));
            assert!((ma - mb).abs() < 1e-12);
            assert!((va - vb).abs() < 1e-12);
        }
    }
}
