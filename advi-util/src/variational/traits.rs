use nalgebra::DVector;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::AdviError;

/// `(K/2)(1 + log 2π)`: entropy of a K-dimensional standard normal.
pub fn standard_normal_entropy(dim: usize) -> f64 {
    0.5 * dim as f64 * (1.0 + (2.0 * std::f64::consts::PI).ln())
}

/// Variational family over the unconstrained coordinates ζ ∈ ℝᴷ.
///
/// Every draw is written as a deterministic, differentiable map
/// `ζ = T_φ(ε)` of a parameter-free base draw `ε ~ N(0, I)` (reparameterization
/// trick). The family parameters φ are exposed as one flat vector so that a
/// single optimizer serves every family.
pub trait VariationalFamily: Clone + Send + Sync {
    /// Number of unconstrained coordinates K.
    fn dim(&self) -> usize;

    /// Length of the flat parameter vector φ.
    fn num_params(&self) -> usize;

    fn parameters(&self) -> &DVector<f64>;

    /// Replace φ; the length must equal [`Self::num_params`].
    fn set_parameters(&mut self, params: DVector<f64>) -> Result<(), AdviError>;

    /// `ζ = T_φ(ε)`
    fn transform(&self, eps: &DVector<f64>) -> DVector<f64>;

    /// Closed-form entropy, including the `(K/2)(1 + log 2π)` constant.
    fn entropy(&self) -> f64;

    /// `∂ entropy / ∂φ`
    fn entropy_gradient(&self) -> DVector<f64>;

    /// Back-propagate `∂f/∂ζ` at `ζ = T_φ(ε)` to `∂f/∂φ`.
    fn pull_back(&self, eps: &DVector<f64>, grad_zeta: &DVector<f64>) -> DVector<f64>;

    /// Mean of ζ.
    fn mean(&self) -> DVector<f64>;

    /// Marginal standard deviations of ζ.
    fn std_dev(&self) -> DVector<f64>;

    /// Draw `ε ~ N(0, I)` of length K.
    fn draw_base<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        DVector::from_fn(self.dim(), |_, _| {
            let v: f64 = StandardNormal.sample(rng);
            v
        })
    }

    /// Draw ζ from the family.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let eps = self.draw_base(rng);
        self.transform(&eps)
    }

    fn params_are_finite(&self) -> bool {
        self.parameters().iter().all(|v| v.is_finite())
    }
}
