use nalgebra::{DMatrix, DVector};

use super::traits::{standard_normal_entropy, VariationalFamily};
use crate::error::AdviError;

/// Full-rank Gaussian q(ζ) = N(μ, LLᵀ).
///
/// Parameters are stored as `[μ₁..μ_K, vec(L)]` where `vec(L)` lists the
/// lower triangle of the Cholesky factor column by column, K(K+1)/2 entries.
/// The diagonal of L is left unconstrained; only `|L_kk|` enters the entropy.
#[derive(Debug, Clone, PartialEq)]
pub struct FullRankGaussian {
    dim: usize,
    params: DVector<f64>,
}

/// Position of `L[i, j]` (i ≥ j) in the packed column-major lower triangle.
fn tri_index(dim: usize, i: usize, j: usize) -> usize {
    j * dim - j * j.saturating_sub(1) / 2 + (i - j)
}

impl FullRankGaussian {
    /// μ = 0, L = I
    pub fn new(dim: usize) -> Self {
        let mut params = DVector::zeros(dim + dim * (dim + 1) / 2);
        for j in 0..dim {
            params[dim + tri_index(dim, j, j)] = 1.0;
        }
        Self { dim, params }
    }

    /// μ as given, L = I
    pub fn from_mean(mu: &DVector<f64>) -> Self {
        let mut ret = Self::new(mu.len());
        ret.params.rows_mut(0, mu.len()).copy_from(mu);
        ret
    }

    /// μ and a lower-triangular factor L; the upper triangle of `chol` is ignored.
    pub fn from_cholesky(mu: &DVector<f64>, chol: &DMatrix<f64>) -> Result<Self, AdviError> {
        let k = mu.len();
        if chol.nrows() != k || chol.ncols() != k {
            return Err(AdviError::Dimension {
                expected: k * k,
                actual: chol.len(),
            });
        }
        let mut ret = Self::from_mean(mu);
        for j in 0..k {
            for i in j..k {
                ret.params[k + tri_index(k, i, j)] = chol[(i, j)];
            }
        }
        Ok(ret)
    }

    fn chol_entry(&self, i: usize, j: usize) -> f64 {
        self.params[self.dim + tri_index(self.dim, i, j)]
    }

    /// Lower-triangular scale matrix L.
    pub fn cholesky_factor(&self) -> DMatrix<f64> {
        let k = self.dim;
        DMatrix::from_fn(k, k, |i, j| if i >= j { self.chol_entry(i, j) } else { 0.0 })
    }

    /// Σ = LLᵀ
    pub fn covariance(&self) -> DMatrix<f64> {
        let l = self.cholesky_factor();
        &l * l.transpose()
    }
}

impl VariationalFamily for FullRankGaussian {
    fn dim(&self) -> usize {
        self.dim
    }

    fn num_params(&self) -> usize {
        self.dim + self.dim * (self.dim + 1) / 2
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
        let mut zeta = self.params.rows(0, k).into_owned();
        for j in 0..k {
            for i in j..k {
                zeta[i] += self.chol_entry(i, j) * eps[j];
            }
        }
        zeta
    }

    fn entropy(&self) -> f64 {
        let log_det: f64 = (0..self.dim)
            .map(|j| self.chol_entry(j, j).abs().ln())
            .sum();
        standard_normal_entropy(self.dim) + log_det
    }

    fn entropy_gradient(&self) -> DVector<f64> {
        let k = self.dim;
        let mut grad = DVector::zeros(self.num_params());
        for j in 0..k {
            grad[k + tri_index(k, j, j)] = 1.0 / self.chol_entry(j, j);
        }
        grad
    }

    fn pull_back(&self, eps: &DVector<f64>, grad_zeta: &DVector<f64>) -> DVector<f64> {
        // ∂ζ_i/∂μ_i = 1, ∂ζ_i/∂L_ij = ε_j
        let k = self.dim;
        let mut grad = DVector::zeros(self.num_params());
        grad.rows_mut(0, k).copy_from(grad_zeta);
        for j in 0..k {
            for i in j..k {
                grad[k + tri_index(k, i, j)] = grad_zeta[i] * eps[j];
            }
        }
        grad
    }

    fn mean(&self) -> DVector<f64> {
        self.params.rows(0, self.dim).into_owned()
    }

    fn std_dev(&self) -> DVector<f64> {
        let l = self.cholesky_factor();
        DVector::from_fn(self.dim, |i, _| l.row(i).norm())
    }
}
