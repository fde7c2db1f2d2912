use thiserror::Error;

/// A constrained/unconstrained mapping is not valid for the given input.
///
/// Raised by [`crate::transform::Transform`] only; never recovered inside the
/// engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("`{name}`[{index}] = {value} is outside the support of {constraint}")]
    OutOfSupport {
        name: String,
        index: usize,
        value: f64,
        constraint: String,
    },

    #[error("`{name}` is not a valid {constraint}: {reason}")]
    InvalidValue {
        name: String,
        constraint: String,
        reason: String,
    },

    #[error("expected a vector of length {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid declaration for `{name}`: {reason}")]
    InvalidSpec { name: String, reason: String },
}

/// Failure of a single model evaluation at one Monte Carlo draw.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("point is outside the model support: {0}")]
    OutOfSupport(String),

    #[error("non-finite log density: {0}")]
    NonFiniteDensity(f64),

    #[error("non-finite gradient at coordinate {0}")]
    NonFiniteGradient(usize),

    #[error("model evaluation exceeded its deadline ({elapsed_ms} ms > {budget_ms} ms)")]
    DeadlineExceeded { elapsed_ms: u128, budget_ms: u128 },

    #[error("model evaluation failed: {0}")]
    Failed(String),
}

impl From<DomainError> for EvaluationError {
    fn from(err: DomainError) -> Self {
        EvaluationError::OutOfSupport(err.to_string())
    }
}

/// Every draw of one ELBO estimate failed, even after resampling.
///
/// The driver treats this as a skipped iteration and retries it a bounded
/// number of times before giving up.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("all {attempted} Monte Carlo draws failed; last error: {last}")]
pub struct RecoverableEvaluationError {
    pub attempted: usize,
    pub last: EvaluationError,
}

/// Top-level error of an ADVI run.
#[derive(Debug, Error)]
pub enum AdviError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("expected {expected} variational parameters, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("optimization failed at iteration {iteration} (last ELBO: {}): {reason}", fmt_elbo(.last_elbo))]
    OptimizationFailure {
        iteration: usize,
        last_elbo: Option<f64>,
        reason: String,
    },
}

fn fmt_elbo(elbo: &Option<f64>) -> String {
    match elbo {
        Some(v) => format!("{:.4}", v),
        None => "none".to_string(),
    }
}
