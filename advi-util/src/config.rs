use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AdviError;
use crate::optimizer::StepSizeSchedule;
use crate::variational::FamilyKind;

/// Settings of one ADVI run.
///
/// Every field has a default, so a JSON document only needs the keys it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdviConfig {
    /// Variational family. Default: meanfield
    pub family: FamilyKind,
    /// Monte Carlo draws per gradient estimate. Default: 10
    pub n_samples: usize,
    /// Monte Carlo draws for value-only ELBO estimates (step-size adaptation
    /// and the reported final ELBO). Default: 100
    pub elbo_samples: usize,
    /// Maximum number of optimization iterations. Default: 10000
    pub max_iterations: usize,
    /// Relative ELBO change below which the run has converged. Default: 0.01
    pub convergence_tolerance: f64,
    /// Number of ELBO values in the convergence window. Default: 200
    pub convergence_window_size: usize,
    /// Step-size scale η, used when adaptation is off. Default: 1.0
    pub initial_step_size: f64,
    /// Pick η from {100, 10, 1, 0.1, 0.01} before the main run. Default: true
    pub adapt_engaged: bool,
    /// Iterations spent on each η candidate. Default: 50
    pub adapt_iterations: usize,
    /// Exponent of the t^(-decay) factor. Default: 0.51
    pub step_decay: f64,
    /// Offset τ in the step-size denominator. Default: 1.0
    pub step_tau: f64,
    /// Weight α of the newest squared gradient. Default: 0.1
    pub step_alpha: f64,
    /// Fresh draws tried in place of a failed one. Default: 3
    pub max_draw_retries: usize,
    /// Retries of an iteration whose draws all failed. Default: 1
    pub iteration_retries: usize,
    /// Include log |det J| in the objective. Default: true
    pub jacobian: bool,
    /// Random seed. Default: 42
    pub random_seed: u64,
    /// Worker threads; `None` uses the global rayon pool. Default: None
    pub num_threads: Option<usize>,
    /// Show a progress bar. Default: false
    pub show_progress: bool,
    /// Log every iteration at info level. Default: false
    pub verbose: bool,
}

impl Default for AdviConfig {
    fn default() -> Self {
        AdviConfig {
            family: FamilyKind::MeanField,
            n_samples: 10,
            elbo_samples: 100,
            max_iterations: 10_000,
            convergence_tolerance: 0.01,
            convergence_window_size: 200,
            initial_step_size: 1.0,
            adapt_engaged: true,
            adapt_iterations: 50,
            step_decay: 0.51,
            step_tau: 1.0,
            step_alpha: 0.1,
            max_draw_retries: 3,
            iteration_retries: 1,
            jacobian: true,
            random_seed: 42,
            num_threads: None,
            show_progress: false,
            verbose: false,
        }
    }
}

impl AdviConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: AdviConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), AdviError> {
        let bad = |msg: String| Err(AdviError::Config(msg));

        if self.n_samples == 0 {
            return bad("n_samples must be at least 1".into());
        }
        if self.elbo_samples == 0 {
            return bad("elbo_samples must be at least 1".into());
        }
        if self.convergence_window_size < 2 {
            return bad(format!(
                "convergence_window_size must be at least 2, got {}",
                self.convergence_window_size
            ));
        }
        if !(self.convergence_tolerance.is_finite() && self.convergence_tolerance > 0.0) {
            return bad(format!(
                "convergence_tolerance must be positive, got {}",
                self.convergence_tolerance
            ));
        }
        if !(self.initial_step_size.is_finite() && self.initial_step_size > 0.0) {
            return bad(format!(
                "initial_step_size must be positive, got {}",
                self.initial_step_size
            ));
        }
        if self.adapt_engaged && self.adapt_iterations == 0 {
            return bad("adapt_iterations must be at least 1 when adaptation is on".into());
        }
        if !(self.step_decay > 0.5 && self.step_decay <= 1.0) {
            return bad(format!(
                "step_decay must lie in (0.5, 1], got {}",
                self.step_decay
            ));
        }
        if !(self.step_tau.is_finite() && self.step_tau > 0.0) {
            return bad(format!("step_tau must be positive, got {}", self.step_tau));
        }
        if !(self.step_alpha > 0.0 && self.step_alpha <= 1.0) {
            return bad(format!(
                "step_alpha must lie in (0, 1], got {}",
                self.step_alpha
            ));
        }
        if self.num_threads == Some(0) {
            return bad("num_threads must be at least 1".into());
        }
        Ok(())
    }

    /// Step-size schedule with scale `eta`.
    pub fn schedule(&self, eta: f64) -> StepSizeSchedule {
        StepSizeSchedule {
            eta,
            tau: self.step_tau,
            alpha: self.step_alpha,
            decay: self.step_decay,
        }
    }
}
