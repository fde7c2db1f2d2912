use nalgebra::DVector;

use super::traits::{standard_normal_entropy, VariationalFamily};
use crate::error::AdviError;

/// Mean-field Gaussian q(ζ) = N(μ, diag(σ²)).
///
/// Parameters are stored as `[μ₁..μ_K, ω₁..ω_K]` with `ω = ln σ`, so σ stays
/// positive while the optimizer works on unconstrained values.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanFieldGaussian {
    dim: usize,
    params: DVector<f64>,
}

impl MeanFieldGaussian {
    /// Standard normal: μ = 0, σ = 1
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            params: DVector::zeros(2 * dim),
        }
    }

    /// μ as given, σ = 1
    pub fn from_mean(mu: &DVector<f64>) -> Self {
        let mut ret = Self::new(mu.len());
        ret.params.rows_mut(0, mu.len()).copy_from(mu);
        ret
    }

    pub fn from_mean_and_log_std(
        mu: &DVector<f64>,
        omega: &DVector<f64>,
    ) -> Result<Self, AdviError> {
        if mu.len() != omega.len() {
            return Err(AdviError::Dimension {
                expected: mu.len(),
                actual: omega.len(),
            });
        }
        let mut ret = Self::from_mean(mu);
        ret.params.rows_mut(mu.len(), mu.len()).copy_from(omega);
        Ok(ret)
    }

    /// ω = ln σ
    pub fn log_std(&self) -> DVector<f64> {
        self.params.rows(self.dim, self.dim).into_owned()
    }
}

impl VariationalFamily for MeanFieldGaussian {
    fn dim(&self) -> usize {
        self.dim
    }

    fn num_params(&self) -> usize {
        2 * self.dim
    }

    fn parameters(&self) -> &DVector<f64> {
        &self.params
    }

    fn set_parameters(&mut self, params: DVector<f64>) -> Result<(), AdviError> {
        if params.len() != self.num_params() {
            return Err(AdviError::Dimension {
                expected: self.num_params(),
                actual: params.len(),
            });
        }
        self.params = params;
        Ok(())
    }

    fn transform(&self, eps: &DVector<f64>) -> DVector<f64> {
        let k = self.dim;
        DVector::from_fn(k, |i, _| self.params[i] + self.params[k + i].exp() * eps[i])
    }

    fn entropy(&self) -> f64 {
        standard_normal_entropy(self.dim) + self.params.rows(self.dim, self.dim).sum()
    }

    fn entropy_gradient(&self) -> DVector<f64> {
        let k = self.dim;
        DVector::from_fn(2 * k, |i, _| if i < k { 0.0 } else { 1.0 })
    }

    fn pull_back(&self, eps: &DVector<f64>, grad_zeta: &DVector<f64>) -> DVector<f64> {
        // ∂ζ_i/∂μ_i = 1, ∂ζ_i/∂ω_i = σ_i ε_i
        let k = self.dim;
        let mut grad = DVector::zeros(2 * k);
        for i in 0..k {
            grad[i] = grad_zeta[i];
            grad[k + i] = grad_zeta[i] * eps[i] * self.params[k + i].exp();
        }
        grad
    }

    fn mean(&self) -> DVector<f64> {
        self.params.rows(0, self.dim).into_owned()
    }

    fn std_dev(&self) -> DVector<f64> {
        self.params.rows(self.dim, self.dim).map(f64::exp)
    }
}
