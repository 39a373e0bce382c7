//! Surrogate model manager
//!
//! Owns the append-only training set and the current fitted surrogate.
//! Refit happens off to the side on a snapshot; the finished model is then
//! published with an `Arc` swap under a short write lock, so in-flight
//! consumers keep reading the previous model until they next ask for the
//! current one. Locking covers only the training-set append and the pointer
//! swap, never the fit itself.

pub mod gp;

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::simulator::Observable;
use crate::space::ParameterSpace;
use crate::{Error, Result};

pub use gp::{GpOutput, OutputTransform, Standardizer};

/// A parameter vector paired with its simulator output. Immutable once
/// created; failed evaluations never become design points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignPoint {
    theta: Vec<f64>,
    observable: Observable,
}

impl DesignPoint {
    /// Pair a parameter vector with a completed simulator output.
    #[must_use]
    pub fn new(theta: Vec<f64>, observable: Observable) -> Self {
        Self { theta, observable }
    }

    /// The parameter vector.
    #[must_use]
    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    /// The simulator output.
    #[must_use]
    pub fn observable(&self) -> &Observable {
        &self.observable
    }
}

/// Append-only collection of valid design points, versioned by growth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    points: Vec<DesignPoint>,
    version: u64,
}

impl TrainingSet {
    /// Empty training set at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Points in insertion order.
    #[must_use]
    pub fn points(&self) -> &[DesignPoint] {
        &self.points
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Snapshot version; bumps once per append batch.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    fn append(&mut self, points: Vec<DesignPoint>) {
        if points.is_empty() {
            return;
        }
        self.points.extend(points);
        self.version += 1;
    }
}

/// A fitted surrogate: either a GP ensemble or the degenerate
/// constant-mean/high-variance model used while data is too sparse to fit.
#[derive(Debug)]
pub enum Surrogate {
    /// Too few points (`len < dim + 1`): constant mean, inflated variance
    Degenerate {
        /// Training snapshot this model reflects
        version: u64,
        /// Per-output constant mean
        means: Vec<f64>,
        /// Per-output inflated variance
        variances: Vec<f64>,
        /// Bound widths used for standardized distances
        bound_widths: Vec<f64>,
    },
    /// One GP per output component over jointly standardized inputs
    Gp {
        /// Training snapshot this model reflects
        version: u64,
        /// Shared input standardizer
        standardizer: Standardizer,
        /// Per-output fitted GPs
        outputs: Vec<GpOutput>,
    },
}

impl Surrogate {
    /// Training-set snapshot version this model was fitted on.
    #[must_use]
    pub const fn version(&self) -> u64 {
        match self {
            Self::Degenerate { version, .. } | Self::Gp { version, .. } => *version,
        }
    }

    /// Number of output components.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        match self {
            Self::Degenerate { means, .. } => means.len(),
            Self::Gp { outputs, .. } => outputs.len(),
        }
    }

    /// Predict per-output `(means, variances)` at a raw parameter vector.
    #[must_use]
    pub fn predict(&self, theta: &[f64]) -> (Vec<f64>, Vec<f64>) {
        match self {
            Self::Degenerate {
                means, variances, ..
            } => (means.clone(), variances.clone()),
            Self::Gp {
                standardizer,
                outputs,
                ..
            } => {
                let x_std = standardizer.transform(theta);
                let mut mu = Vec::with_capacity(outputs.len());
                let mut var = Vec::with_capacity(outputs.len());
                for output in outputs {
                    let (m, v) = output.predict(&x_std);
                    mu.push(m);
                    var.push(v);
                }
                (mu, var)
            }
        }
    }

    /// Mean predictive variance across outputs (acquisition score input).
    #[must_use]
    pub fn mean_variance(&self, theta: &[f64]) -> f64 {
        let (_, vars) = self.predict(theta);
        vars.iter().sum::<f64>() / vars.len().max(1) as f64
    }

    /// Per-output gradients of mean and variance with respect to the RAW
    /// parameter vector. `None` when the model is degenerate or any output
    /// was log-transformed; the sampler then uses its gradient-free kernel.
    #[must_use]
    pub fn gradient(&self, theta: &[f64]) -> Option<SurrogateGradient> {
        match self {
            Self::Degenerate { .. } => None,
            Self::Gp {
                standardizer,
                outputs,
                ..
            } => {
                let x_std = standardizer.transform(theta);
                let mut dmeans = Vec::with_capacity(outputs.len());
                let mut dvars = Vec::with_capacity(outputs.len());
                for output in outputs {
                    let (mut dm, mut dv) = output.gradient(&x_std)?;
                    // Chain rule through input standardization.
                    for (d, (g_m, g_v)) in dm.iter_mut().zip(dv.iter_mut()).enumerate() {
                        let scale = 1.0 / standardizer.input_std(d);
                        *g_m *= scale;
                        *g_v *= scale;
                    }
                    dmeans.push(dm);
                    dvars.push(dv);
                }
                Some(SurrogateGradient { dmeans, dvars })
            }
        }
    }

    /// Distance between two raw vectors in the model's standardized space.
    /// The degenerate model falls back to bound-width scaling.
    #[must_use]
    pub fn standardized_distance(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Self::Degenerate { bound_widths, .. } => a
                .iter()
                .zip(b)
                .zip(bound_widths)
                .map(|((&x, &y), &w)| ((x - y) / w.max(1e-12)).powi(2))
                .sum::<f64>()
                .sqrt(),
            Self::Gp { standardizer, .. } => standardizer.distance(a, b),
        }
    }

    /// Held-out surrogate quality: mean LOO-CV RMSE across outputs.
    /// `None` for the degenerate model.
    #[must_use]
    pub fn loo_cv_rmse(&self) -> Option<f64> {
        match self {
            Self::Degenerate { .. } => None,
            Self::Gp { outputs, .. } => {
                let sum: f64 = outputs.iter().map(GpOutput::loo_rmse).sum();
                Some(sum / outputs.len().max(1) as f64)
            }
        }
    }
}

/// Per-output gradients of predictive mean and variance in raw input space.
#[derive(Debug, Clone)]
pub struct SurrogateGradient {
    /// `dmeans[k][d]` = d mean_k / d theta_d
    pub dmeans: Vec<Vec<f64>>,
    /// `dvars[k][d]` = d var_k / d theta_d
    pub dvars: Vec<Vec<f64>>,
}

/// Owner of the training set and the published surrogate.
pub struct SurrogateManager {
    bounds: Vec<(f64, f64)>,
    output_dim: usize,
    training: Mutex<TrainingSet>,
    current: RwLock<Arc<Surrogate>>,
}

impl SurrogateManager {
    /// Create a manager for a parameter space and a fixed output dimension.
    #[must_use]
    pub fn new(space: &ParameterSpace, output_dim: usize) -> Self {
        let bounds = space.bounds();
        let initial = Arc::new(degenerate_model(&TrainingSet::new(), &bounds, output_dim));
        Self {
            bounds,
            output_dim,
            training: Mutex::new(TrainingSet::new()),
            current: RwLock::new(initial),
        }
    }

    /// Rebuild a manager from a persisted training set (session resume).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when any restored point violates the
    /// declared bounds or output dimension.
    pub fn restore(
        space: &ParameterSpace,
        output_dim: usize,
        training: TrainingSet,
    ) -> Result<Self> {
        let manager = Self::new(space, output_dim);
        let points = training.points().to_vec();
        manager.append(points)?;
        Ok(manager)
    }

    /// Append validated design points and refit.
    ///
    /// The fit runs outside any lock; publication is a single pointer swap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on out-of-bounds vectors or output
    /// length mismatches; nothing is appended in that case.
    pub fn append(&self, points: Vec<DesignPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            if point.theta.len() != self.bounds.len() {
                return Err(Error::Configuration(format!(
                    "design point has {} components, space has {}",
                    point.theta.len(),
                    self.bounds.len()
                )));
            }
            if point
                .theta
                .iter()
                .zip(&self.bounds)
                .any(|(&x, &(lo, hi))| x < lo || x > hi)
            {
                return Err(Error::Configuration(format!(
                    "design point {:?} violates declared bounds",
                    point.theta
                )));
            }
            if point.observable.len() != self.output_dim {
                return Err(Error::Configuration(format!(
                    "observable has {} components, expected {}",
                    point.observable.len(),
                    self.output_dim
                )));
            }
        }

        // Critical section 1: the append itself.
        let snapshot = {
            let mut training = self.training.lock().map_err(poisoned)?;
            training.append(points);
            training.clone()
        };

        debug!(
            points = snapshot.len(),
            version = snapshot.version(),
            "training set grew, refitting surrogate"
        );
        let model = fit_surrogate(&snapshot, &self.bounds, self.output_dim);
        info!(
            version = model.version(),
            degenerate = matches!(model, Surrogate::Degenerate { .. }),
            "surrogate refit complete"
        );

        // Critical section 2: pointer publication.
        let mut current = self.current.write().map_err(poisoned)?;
        *current = Arc::new(model);
        Ok(())
    }

    /// Clone a handle to the currently published surrogate.
    ///
    /// # Panics
    ///
    /// Panics only if another thread panicked while publishing (poisoned
    /// lock), which already aborts the session.
    #[must_use]
    pub fn current(&self) -> Arc<Surrogate> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned_guard) => Arc::clone(&poisoned_guard.into_inner()),
        }
    }

    /// Clone of the current training set (persistence, diagnostics).
    #[must_use]
    pub fn training_snapshot(&self) -> TrainingSet {
        match self.training.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned_guard) => poisoned_guard.into_inner().clone(),
        }
    }

    /// Number of accumulated design points.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.training.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned_guard) => poisoned_guard.into_inner().len(),
        }
    }

    /// True when no design points have been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Configuration("surrogate manager lock poisoned".to_string())
}

fn degenerate_model(training: &TrainingSet, bounds: &[(f64, f64)], output_dim: usize) -> Surrogate {
    let n = training.len();
    let mut means = vec![0.0; output_dim];
    let mut variances = vec![1e6; output_dim];
    if n > 0 {
        for k in 0..output_dim {
            let ys: Vec<f64> = training
                .points()
                .iter()
                .map(|p| p.observable().values[k])
                .collect();
            let mean = ys.iter().sum::<f64>() / n as f64;
            let var = ys.iter().map(|&y| (y - mean).powi(2)).sum::<f64>() / n as f64;
            means[k] = mean;
            // Inflated so the likelihood stays honest about ignorance.
            variances[k] = (var.max((0.1 * mean).powi(2)).max(1.0)) * 10.0;
        }
    }
    Surrogate::Degenerate {
        version: training.version(),
        means,
        variances,
        bound_widths: bounds.iter().map(|&(lo, hi)| hi - lo).collect(),
    }
}

fn fit_surrogate(training: &TrainingSet, bounds: &[(f64, f64)], output_dim: usize) -> Surrogate {
    let dim = bounds.len();
    if training.len() < dim + 1 {
        return degenerate_model(training, bounds, output_dim);
    }
    let xs: Vec<Vec<f64>> = training
        .points()
        .iter()
        .map(|p| p.theta().to_vec())
        .collect();
    let standardizer = Standardizer::fit(&xs, dim);
    let x_std: Vec<Vec<f64>> = xs.iter().map(|x| standardizer.transform(x)).collect();

    let mut outputs = Vec::with_capacity(output_dim);
    for k in 0..output_dim {
        let ys: Vec<f64> = training
            .points()
            .iter()
            .map(|p| p.observable().values[k])
            .collect();
        match GpOutput::fit(&x_std, &ys) {
            Some(output) => outputs.push(output),
            // A single unfittable output degrades the whole model rather
            // than mixing fitted and constant components.
            None => return degenerate_model(training, bounds, output_dim),
        }
    }
    Surrogate::Gp {
        version: training.version(),
        standardizer,
        outputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn point(theta: Vec<f64>) -> DesignPoint {
        let y = theta.iter().sum();
        DesignPoint::new(theta, Observable::scalar(y))
    }

    #[test]
    fn sparse_training_yields_degenerate_model() {
        let space = unit_space(3);
        let manager = SurrogateManager::new(&space, 1);
        manager
            .append(vec![point(vec![0.1, 0.2, 0.3]), point(vec![0.9, 0.8, 0.7])])
            .unwrap();
        let model = manager.current();
        assert!(matches!(*model, Surrogate::Degenerate { .. }));
        let (_, vars) = model.predict(&[0.5, 0.5, 0.5]);
        assert!(vars[0] > 1.0);
    }

    #[test]
    fn enough_points_yield_gp() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        let points: Vec<DesignPoint> = (0..8)
            .map(|i| {
                let a = f64::from(i) / 7.0;
                point(vec![a, 1.0 - a * 0.5])
            })
            .collect();
        manager.append(points).unwrap();
        assert!(matches!(*manager.current(), Surrogate::Gp { .. }));
    }

    #[test]
    fn out_of_bounds_point_rejected_atomically() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        let err = manager.append(vec![point(vec![0.5, 1.5])]);
        assert!(err.is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn old_handle_survives_refit() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        let points: Vec<DesignPoint> = (0..6)
            .map(|i| point(vec![f64::from(i) / 5.0, f64::from(i % 2)]))
            .collect();
        manager.append(points).unwrap();
        let held = manager.current();
        let held_version = held.version();
        manager.append(vec![point(vec![0.42, 0.42])]).unwrap();
        // The in-flight handle still reads the model it started with.
        assert_eq!(held.version(), held_version);
        assert!(manager.current().version() > held_version);
    }

    #[test]
    fn variance_shrinks_near_new_data() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        // Train everywhere except the upper-right corner.
        let points: Vec<DesignPoint> = (0..8)
            .map(|i| point(vec![f64::from(i) / 10.0, f64::from(i % 4) / 10.0]))
            .collect();
        manager.append(points).unwrap();
        let q = [0.9, 0.9];
        let (_, before) = manager.current().predict(&q);
        manager.append(vec![point(vec![0.9, 0.9])]).unwrap();
        let (_, after) = manager.current().predict(&q);
        assert!(
            after[0] < before[0],
            "variance did not shrink at new data: {} -> {}",
            before[0],
            after[0]
        );
    }

    #[test]
    fn average_variance_shrinks_as_data_grows() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        let initial: Vec<DesignPoint> = (0..8)
            .map(|i| point(vec![f64::from(i) / 10.0, f64::from(i % 4) / 10.0]))
            .collect();
        manager.append(initial).unwrap();
        // Held-out grid covering the whole box.
        let queries: Vec<Vec<f64>> = (0..5)
            .flat_map(|i| (0..5).map(move |j| vec![f64::from(i) / 4.0, f64::from(j) / 4.0]))
            .collect();
        let avg = |model: &Surrogate| {
            queries.iter().map(|q| model.mean_variance(q)).sum::<f64>() / queries.len() as f64
        };
        let before = avg(&manager.current());
        // Fill in regions the initial design left sparse.
        let extra: Vec<DesignPoint> = (0..8)
            .map(|i| point(vec![0.15 + f64::from(i) / 12.0, 0.9 - f64::from(i) / 11.0]))
            .collect();
        manager.append(extra).unwrap();
        let after = avg(&manager.current());
        assert!(
            after < before,
            "average held-out variance did not shrink: {before} -> {after}"
        );
    }

    #[test]
    fn version_tracks_training_snapshot() {
        let space = unit_space(2);
        let manager = SurrogateManager::new(&space, 1);
        manager
            .append(vec![
                point(vec![0.0, 0.0]),
                point(vec![0.5, 0.5]),
                point(vec![1.0, 1.0]),
            ])
            .unwrap();
        assert_eq!(
            manager.current().version(),
            manager.training_snapshot().version()
        );
    }
}
