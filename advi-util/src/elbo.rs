use log::debug;
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{EvaluationError, RecoverableEvaluationError};
use crate::model::{log_density_unconstrained, ModelEvaluator};
use crate::transform::Transform;
use crate::variational::VariationalFamily;

/// Monte Carlo estimate of the ELBO and its gradient with respect to φ.
#[derive(Debug, Clone)]
pub struct ElboEstimate {
    pub value: f64,
    /// Empty for value-only estimates.
    pub gradient: DVector<f64>,
    /// Draws that entered the average.
    pub n_samples: usize,
    /// Draws dropped after exhausting their retries.
    pub failed_draws: usize,
    /// Fresh base draws taken to replace failed ones.
    pub resampled_draws: usize,
}

/// Reparameterization-trick estimator of
/// `E_q[log p(y, T⁻¹(ζ)) + log |det J(ζ)|] + H[q]`.
///
/// Draws are evaluated in parallel. Draw `i` gets its own `SmallRng` seeded
/// from one base seed taken from the caller's rng, and the per-draw results are
/// reduced in index order, so the estimate only depends on that seed.
#[derive(Debug, Clone)]
pub struct ElboEstimator {
    n_samples: usize,
    max_draw_retries: usize,
    jacobian: bool,
}

struct DrawOutcome {
    result: Result<(f64, Option<DVector<f64>>), EvaluationError>,
    retries: usize,
}

impl ElboEstimator {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            max_draw_retries: 3,
            jacobian: true,
        }
    }

    /// How many times a failed draw is replaced by a fresh one before it is
    /// dropped.
    pub fn with_max_draw_retries(mut self, max_draw_retries: usize) -> Self {
        self.max_draw_retries = max_draw_retries;
        self
    }

    /// Whether `log |det J|` enters the objective.
    pub fn with_jacobian(mut self, jacobian: bool) -> Self {
        self.jacobian = jacobian;
        self
    }

    /// Same settings, different number of draws.
    pub fn with_samples(&self, n_samples: usize) -> Self {
        Self {
            n_samples,
            ..self.clone()
        }
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// ELBO value and gradient with respect to the family parameters.
    pub fn estimate<F, M, R>(
        &self,
        family: &F,
        transform: &Transform,
        model: &M,
        rng: &mut R,
    ) -> Result<ElboEstimate, RecoverableEvaluationError>
    where
        F: VariationalFamily,
        M: ModelEvaluator + ?Sized,
        R: Rng + ?Sized,
    {
        self.run_draws(family, transform, model, rng, true)
    }

    /// ELBO value only; skips the pull-back to φ.
    pub fn estimate_value<F, M, R>(
        &self,
        family: &F,
        transform: &Transform,
        model: &M,
        rng: &mut R,
    ) -> Result<f64, RecoverableEvaluationError>
    where
        F: VariationalFamily,
        M: ModelEvaluator + ?Sized,
        R: Rng + ?Sized,
    {
        Ok(self.run_draws(family, transform, model, rng, false)?.value)
    }

    fn run_draws<F, M, R>(
        &self,
        family: &F,
        transform: &Transform,
        model: &M,
        rng: &mut R,
        with_gradient: bool,
    ) -> Result<ElboEstimate, RecoverableEvaluationError>
    where
        F: VariationalFamily,
        M: ModelEvaluator + ?Sized,
        R: Rng + ?Sized,
    {
        let base_seed: u64 = rng.random();

        let outcomes: Vec<DrawOutcome> = (0..self.n_samples)
            .into_par_iter()
            .map(|i| {
                let seed = base_seed.wrapping_add(i as u64);
                self.one_draw(family, transform, model, seed, with_gradient)
            })
            .collect();

        let mut value_sum = 0.0;
        let mut grad_sum = if with_gradient {
            DVector::zeros(family.num_params())
        } else {
            DVector::zeros(0)
        };
        let mut n_valid = 0;
        let mut failed_draws = 0;
        let mut resampled_draws = 0;
        let mut last_error = None;

        for out in outcomes {
            resampled_draws += out.retries;
            match out.result {
                Ok((lp, grad)) => {
                    value_sum += lp;
                    if let Some(g) = grad {
                        grad_sum += g;
                    }
                    n_valid += 1;
                }
                Err(err) => {
                    failed_draws += 1;
                    last_error = Some(err);
                }
            }
        }

        if n_valid == 0 {
            let last = last_error
                .unwrap_or_else(|| EvaluationError::Failed("no draws requested".into()));
            return Err(RecoverableEvaluationError {
                attempted: self.n_samples * (self.max_draw_retries + 1),
                last,
            });
        }

        if failed_draws > 0 {
            debug!(
                "dropped {} of {} draws ({} resampled)",
                failed_draws, self.n_samples, resampled_draws
            );
        }

        let denom = n_valid as f64;
        let value = value_sum / denom + family.entropy();
        let gradient = if with_gradient {
            grad_sum / denom + family.entropy_gradient()
        } else {
            grad_sum
        };

        Ok(ElboEstimate {
            value,
            gradient,
            n_samples: n_valid,
            failed_draws,
            resampled_draws,
        })
    }

    fn one_draw<F, M>(
        &self,
        family: &F,
        transform: &Transform,
        model: &M,
        seed: u64,
        with_gradient: bool,
    ) -> DrawOutcome
    where
        F: VariationalFamily,
        M: ModelEvaluator + ?Sized,
    {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut last = EvaluationError::Failed("draw was never attempted".into());

        for attempt in 0..=self.max_draw_retries {
            let eps = family.draw_base(&mut rng);
            let zeta = family.transform(&eps);
            match log_density_unconstrained(model, transform, &zeta, self.jacobian) {
                Ok((lp, grad_zeta)) => {
                    let grad = with_gradient.then(|| family.pull_back(&eps, &grad_zeta));
                    return DrawOutcome {
                        result: Ok((lp, grad)),
                        retries: attempt,
                    };
                }
                Err(err) => last = err,
            }
        }

        DrawOutcome {
            result: Err(last),
            retries: self.max_draw_retries,
        }
    }
}
