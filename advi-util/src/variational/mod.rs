//! Gaussian variational families over the unconstrained coordinates.
//!
//! - [`MeanFieldGaussian`]: independent coordinates, O(K) parameters
//! - [`FullRankGaussian`]: dense Cholesky factor, O(K²) parameters
//!
//! Both implement [`VariationalFamily`], and [`GaussianFamily`] selects one of
//! them at run time from a [`FamilyKind`].

mod gaussian_fullrank;
mod gaussian_meanfield;
mod traits;

pub use gaussian_fullrank::FullRankGaussian;
pub use gaussian_meanfield::MeanFieldGaussian;
pub use traits::{standard_normal_entropy, VariationalFamily};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::AdviError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    #[default]
    MeanField,
    FullRank,
}

impl std::str::FromStr for FamilyKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "meanfield" | "mean-field" | "mean_field" => Ok(Self::MeanField),
            "fullrank" | "full-rank" | "full_rank" => Ok(Self::FullRank),
            _ => anyhow::bail!("Unknown variational family: {}", s),
        }
    }
}

impl std::fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FamilyKind::MeanField => write!(f, "meanfield"),
            FamilyKind::FullRank => write!(f, "fullrank"),
        }
    }
}

/// Run-time choice between the two Gaussian families.
#[derive(Debug, Clone, PartialEq)]
pub enum GaussianFamily {
    MeanField(MeanFieldGaussian),
    FullRank(FullRankGaussian),
}

impl GaussianFamily {
    /// Standard normal initialization of the requested kind.
    pub fn new(kind: FamilyKind, dim: usize) -> Self {
        match kind {
            FamilyKind::MeanField => GaussianFamily::MeanField(MeanFieldGaussian::new(dim)),
            FamilyKind::FullRank => GaussianFamily::FullRank(FullRankGaussian::new(dim)),
        }
    }

    /// Unit scale centered at `mu`.
    pub fn from_mean(kind: FamilyKind, mu: &DVector<f64>) -> Self {
        match kind {
            FamilyKind::MeanField => GaussianFamily::MeanField(MeanFieldGaussian::from_mean(mu)),
            FamilyKind::FullRank => GaussianFamily::FullRank(FullRankGaussian::from_mean(mu)),
        }
    }

    pub fn kind(&self) -> FamilyKind {
        match self {
            GaussianFamily::MeanField(_) => FamilyKind::MeanField,
            GaussianFamily::FullRank(_) => FamilyKind::FullRank,
        }
    }
}

impl VariationalFamily for GaussianFamily {
    fn dim(&self) -> usize {
        match self {
            GaussianFamily::MeanField(q) => q.dim(),
            GaussianFamily::FullRank(q) => q.dim(),
        }
    }

    fn num_params(&self) -> usize {
        match self {
            GaussianFamily::MeanField(q) => q.num_params(),
            GaussianFamily::FullRank(q) => q.num_params(),
        }
    }

    fn parameters(&self) -> &DVector<f64> {
        match self {
            GaussianFamily::MeanField(q) => q.parameters(),
            GaussianFamily::FullRank(q) => q.parameters(),
        }
    }

    fn set_parameters(&mut self, params: DVector<f64>) -> Result<(), AdviError> {
        match self {
            GaussianFamily::MeanField(q) => q.set_parameters(params),
            GaussianFamily::FullRank(q) => q.set_parameters(params),
        }
    }

    fn transform(&self, eps: &DVector<f64>) -> DVector<f64> {
        match self {
            GaussianFamily::MeanField(q) => q.transform(eps),
            GaussianFamily::FullRank(q) => q.transform(eps),
        }
    }

    fn entropy(&self) -> f64 {
        match self {
            GaussianFamily::MeanField(q) => q.entropy(),
            GaussianFamily::FullRank(q) => q.entropy(),
        }
    }

    fn entropy_gradient(&self) -> DVector<f64> {
        match self {
            GaussianFamily::MeanField(q) => q.entropy_gradient(),
            GaussianFamily::FullRank(q) => q.entropy_gradient(),
        }
    }

    fn pull_back(&self, eps: &DVector<f64>, grad_zeta: &DVector<f64>) -> DVector<f64> {
        match self {
            GaussianFamily::MeanField(q) => q.pull_back(eps, grad_zeta),
            GaussianFamily::FullRank(q) => q.pull_back(eps, grad_zeta),
        }
    }

    fn mean(&self) -> DVector<f64> {
        match self {
            GaussianFamily::MeanField(q) => q.mean(),
            GaussianFamily::FullRank(q) => q.mean(),
        }
    }

    fn std_dev(&self) -> DVector<f64> {
        match self {
            GaussianFamily::MeanField(q) => q.std_dev(),
            GaussianFamily::FullRank(q) => q.std_dev(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn kind_parses_and_prints() {
        assert_eq!("meanfield".parse::<FamilyKind>().unwrap(), FamilyKind::MeanField);
        assert_eq!("Full-Rank".parse::<FamilyKind>().unwrap(), FamilyKind::FullRank);
        assert!("dense".parse::<FamilyKind>().is_err());
        assert_eq!(FamilyKind::FullRank.to_string(), "fullrank");
        assert_eq!(
            serde_json::to_string(&FamilyKind::MeanField).unwrap(),
            "\"meanfield\""
        );
    }

    #[test]
    fn both_kinds_agree_at_standard_normal() {
        let mf = GaussianFamily::new(FamilyKind::MeanField, 4);
        let fr = GaussianFamily::new(FamilyKind::FullRank, 4);
        assert_abs_diff_eq!(mf.entropy(), fr.entropy(), epsilon = 1e-12);
        assert_eq!(mf.num_params(), 8);
        assert_eq!(fr.num_params(), 4 + 10);

        let eps = DVector::from_vec(vec![0.1, -0.2, 0.3, -0.4]);
        assert_abs_diff_eq!(mf.transform(&eps), fr.transform(&eps), epsilon = 1e-12);
        assert_eq!(mf.kind(), FamilyKind::MeanField);
        assert_eq!(fr.kind(), FamilyKind::FullRank);
    }

    #[test]
    fn from_mean_centers_both_kinds() {
        let mu = DVector::from_vec(vec![2.0, -3.0]);
        for kind in [FamilyKind::MeanField, FamilyKind::FullRank] {
            let q = GaussianFamily::from_mean(kind, &mu);
            assert_abs_diff_eq!(q.mean(), mu, epsilon = 1e-15);
            assert_abs_diff_eq!(q.std_dev(), DVector::from_element(2, 1.0), epsilon = 1e-15);
        }
    }
}
