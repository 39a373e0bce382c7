//! Adaptive random-walk Metropolis (gradient-free fallback)
//!
//! Gaussian proposals in unconstrained space with a global scale adapted
//! toward a 0.35 acceptance rate during tuning (Robbins-Monro). Used when
//! the surrogate has no gradient: degenerate models and log-transformed
//! outputs.

use rand::rngs::StdRng;
use rand::Rng;

use super::{randn, ChainRun, PosteriorModel};
use crate::CancelHandle;

const TARGET_ACCEPT: f64 = 0.35;

/// Run one random-walk chain: `tuning` adaptation draws (discarded)
/// followed by `draws` retained draws. Cancellation is checked between
/// draws. A proposal with a non-finite density (outside the support or a
/// numerically broken surrogate read) counts as a divergence after tuning.
pub(crate) fn run_chain(
    model: &PosteriorModel,
    init_z: Vec<f64>,
    tuning: usize,
    draws: usize,
    rng: &mut StdRng,
    cancel: &CancelHandle,
) -> ChainRun {
    let mut z = init_z;
    let mut logp = model.logp_z(&z);

    let mut log_scale = (0.5_f64).ln();
    let total = tuning + draws;
    let mut out_z = Vec::with_capacity(draws);
    let mut out_lp = Vec::with_capacity(draws);
    let mut divergences = 0;

    for step in 0..total {
        if cancel.is_cancelled() {
            return ChainRun {
                draws_z: out_z,
                logps: out_lp,
                divergences,
                cancelled: true,
            };
        }
        let in_tuning = step < tuning;
        let scale = log_scale.exp();

        let proposal: Vec<f64> = z.iter().map(|&zd| zd + scale * randn(rng)).collect();
        let proposal_logp = model.logp_z(&proposal);

        let accept_prob = if proposal_logp.is_nan() {
            if !in_tuning {
                divergences += 1;
            }
            0.0
        } else {
            let log_ratio = proposal_logp - logp;
            if log_ratio.is_nan() {
                0.0
            } else {
                log_ratio.exp().min(1.0)
            }
        };

        if rng.gen::<f64>() < accept_prob {
            z = proposal;
            logp = proposal_logp;
        }

        if in_tuning {
            // Robbins-Monro step toward the target acceptance rate.
            let gain = (step as f64 + 1.0).powf(-0.6);
            log_scale += gain * (accept_prob - TARGET_ACCEPT);
        } else {
            out_z.push(z.clone());
            out_lp.push(logp);
        }
    }

    ChainRun {
        draws_z: out_z,
        logps: out_lp,
        divergences,
        cancelled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Observable, ObservedData};
    use crate::space::{Distribution, ParameterSpace};
    use crate::surrogate::{DesignPoint, SurrogateManager};
    use rand::SeedableRng;

    #[test]
    fn chain_stays_in_support_and_moves() {
        let mut space = ParameterSpace::new();
        space
            .register(
                "x",
                Distribution::Uniform {
                    low: 0.0,
                    high: 1.0,
                },
                (0.0, 1.0),
            )
            .unwrap();
        // Degenerate surrogate (one training point): gradient-free path.
        let manager = SurrogateManager::new(&space, 1);
        manager
            .append(vec![DesignPoint::new(vec![0.5], Observable::scalar(0.5))])
            .unwrap();
        let observed = ObservedData::new(vec![0.5], vec![0.1]).unwrap();
        let model = PosteriorModel::new(&space, manager.current(), &observed);

        let mut rng = StdRng::seed_from_u64(5);
        let cancel = CancelHandle::new();
        let run = run_chain(&model, vec![0.0], 200, 400, &mut rng, &cancel);
        assert_eq!(run.draws_z.len(), 400);
        assert!(!run.cancelled);
        let xs: Vec<f64> = run
            .draws_z
            .iter()
            .map(|z| model.transform().to_constrained(z)[0])
            .collect();
        assert!(xs.iter().all(|&x| (0.0..=1.0).contains(&x)));
        let spread = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
            - xs.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(spread > 0.1, "chain barely moved: spread {spread}");
    }
}
