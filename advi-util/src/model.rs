use nalgebra::DVector;
use std::time::{Duration, Instant};

use crate::error::EvaluationError;
use crate::transform::Transform;

/// `(log density, gradient)` or the reason the evaluation failed.
pub type DensityResult = Result<(f64, DVector<f64>), EvaluationError>;

/// Log joint density with its gradient.
///
/// The evaluator is a black box to the engine: it only needs the total
/// `log p(y, θ)` and `∂/∂θ log p(y, θ)` at a constrained point θ produced by
/// [`Transform::inverse`]. It is called from several worker threads at once,
/// so implementations must be `Sync` and must not rely on call order.
pub trait ModelEvaluator: Sync {
    /// # Arguments
    /// * `theta` - constrained parameter vector
    ///
    /// # Returns
    /// `(log density, gradient)`, the gradient having the same length as `theta`
    fn log_joint_density_and_gradient(&self, theta: &DVector<f64>) -> DensityResult;
}

impl<F> ModelEvaluator for F
where
    F: Fn(&DVector<f64>) -> DensityResult + Sync,
{
    fn log_joint_density_and_gradient(&self, theta: &DVector<f64>) -> DensityResult {
        self(theta)
    }
}

/// Wraps an evaluator and reports calls slower than `budget` as
/// [`EvaluationError::DeadlineExceeded`].
///
/// The call itself is not interrupted; a slow result is discarded after the
/// fact and the draw is handled like any other failed evaluation.
pub struct WithDeadline<M> {
    inner: M,
    budget: Duration,
}

impl<M: ModelEvaluator> WithDeadline<M> {
    pub fn new(inner: M, budget: Duration) -> Self {
        Self { inner, budget }
    }

    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: ModelEvaluator> ModelEvaluator for WithDeadline<M> {
    fn log_joint_density_and_gradient(&self, theta: &DVector<f64>) -> DensityResult {
        let start = Instant::now();
        let out = self.inner.log_joint_density_and_gradient(theta)?;
        let elapsed = start.elapsed();
        if elapsed > self.budget {
            return Err(EvaluationError::DeadlineExceeded {
                elapsed_ms: elapsed.as_millis(),
                budget_ms: self.budget.as_millis(),
            });
        }
        Ok(out)
    }
}

/// Evaluate the model at an unconstrained point.
///
/// Returns `log p(inverse(ζ)) [+ log |det J(ζ)|]` and its gradient with
/// respect to ζ. Any non-finite value is reported as an error so that it never
/// reaches an average.
pub fn log_density_unconstrained<M: ModelEvaluator + ?Sized>(
    model: &M,
    transform: &Transform,
    zeta: &DVector<f64>,
    jacobian: bool,
) -> DensityResult {
    let theta = transform.inverse(zeta)?;
    let (lp, grad_theta) = model.log_joint_density_and_gradient(&theta)?;

    if grad_theta.len() != theta.len() {
        return Err(EvaluationError::Failed(format!(
            "gradient has length {}, expected {}",
            grad_theta.len(),
            theta.len()
        )));
    }

    let log_det = if jacobian {
        transform.log_det_jacobian_inverse(zeta)?
    } else {
        0.0
    };

    let total = lp + log_det;
    if !total.is_finite() {
        return Err(EvaluationError::NonFiniteDensity(total));
    }

    let grad = transform.gradient_unconstrained(zeta, &grad_theta, jacobian)?;
    if let Some(i) = grad.iter().position(|g| !g.is_finite()) {
        return Err(EvaluationError::NonFiniteGradient(i));
    }

    Ok((total, grad))
}
