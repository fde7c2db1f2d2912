//! Automatic differentiation variational inference (ADVI).
//!
//! Approximates the posterior of a model with continuous, possibly
//! constrained parameters by a Gaussian over unconstrained coordinates, fit by
//! stochastic gradient ascent on the evidence lower bound (ELBO).
//!
//! # Pipeline
//!
//! 1. Each declared parameter is mapped to ℝ by a bijection whose
//!    log-Jacobian is added to the model's log density ([`transform`]).
//! 2. A mean-field or full-rank Gaussian q(ζ) is placed on the unconstrained
//!    coordinates ([`variational`]).
//! 3. The ELBO gradient is estimated by the reparameterization trick with
//!    draws evaluated in parallel ([`elbo`]).
//! 4. φ is updated with an adaptive per-coordinate step size until the ELBO
//!    stops moving ([`optimizer`], [`convergence`]).
//!
//! # Usage
//!
//! ```ignore
//! use advi_util::*;
//!
//! let specs = vec![
//!     ParameterSpec::scalar("mu", Constraint::Real),
//!     ParameterSpec::scalar("sigma", Constraint::Positive),
//! ];
//! let model = |theta: &DVector<f64>| -> DensityResult { my_log_joint(theta) };
//! let fit = Advi::new(specs, model, AdviConfig::default())?.run()?;
//! let draws = fit.draw_posterior_samples(1000, &mut rng)?;
//! ```
//!
//! # References
//!
//! Kucukelbir, Tran, Ranganath, Gelman & Blei (2017). "Automatic
//! differentiation variational inference." JMLR 18(14):1-45.

/// Run-level settings
pub mod config;

/// ELBO window and optimization state machine
pub mod convergence;

/// Constrained draws and their summaries
pub mod draws;

/// Outer loop, step-size adaptation and fitted result
pub mod driver;

/// Monte Carlo ELBO and gradient estimator
pub mod elbo;

/// Error taxonomy
pub mod error;

/// Interface to the user's log joint density
pub mod model;

/// Adaptive step-size gradient ascent
pub mod optimizer;

/// Constrained to unconstrained bijections
pub mod transform;

/// Gaussian variational families
pub mod variational;

pub use config::AdviConfig;
pub use draws::ApproxDraws;
pub use driver::{Advi, AdviFit, ConvergenceStatus};
pub use elbo::{ElboEstimate, ElboEstimator};
pub use error::{AdviError, DomainError, EvaluationError, RecoverableEvaluationError};
pub use model::{DensityResult, ModelEvaluator, WithDeadline};
pub use transform::{Constraint, ParameterSpec, Transform};
pub use variational::{FamilyKind, GaussianFamily, VariationalFamily};

pub use nalgebra::DVector;
