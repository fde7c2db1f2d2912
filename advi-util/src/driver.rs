use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info, warn};
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::AdviConfig;
use crate::convergence::{ConvergenceMonitor, Phase};
use crate::draws::ApproxDraws;
use crate::elbo::{ElboEstimate, ElboEstimator};
use crate::error::AdviError;
use crate::model::ModelEvaluator;
use crate::optimizer::StochasticOptimizer;
use crate::transform::{ParameterSpec, Transform};
use crate::variational::{GaussianFamily, VariationalFamily};

/// Step-size scales tried, in order, when adaptation is engaged.
pub const ETA_SEQUENCE: [f64; 5] = [100.0, 10.0, 1.0, 0.1, 0.01];

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    Converged,
    MaxIterationsReached,
    Cancelled,
}

impl std::fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvergenceStatus::Converged => write!(f, "converged"),
            ConvergenceStatus::MaxIterationsReached => write!(f, "maximum iterations reached"),
            ConvergenceStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Fitted variational approximation.
#[derive(Debug, Clone)]
pub struct AdviFit {
    family: GaussianFamily,
    transform: Transform,
    pub status: ConvergenceStatus,
    /// Completed optimization iterations, excluding step-size adaptation.
    pub iterations: usize,
    /// ELBO estimate of every iteration; NaN marks a skipped update.
    pub elbo_trace: Vec<f64>,
    /// Value-only ELBO of the returned parameters with `elbo_samples` draws.
    pub final_elbo: f64,
    /// Step-size scale used by the main run.
    pub eta: f64,
}

impl AdviFit {
    /// Final variational parameters φ.
    pub fn parameters(&self) -> &DVector<f64> {
        self.family.parameters()
    }

    pub fn family(&self) -> &GaussianFamily {
        &self.family
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Mean of q in unconstrained space.
    pub fn mean_unconstrained(&self) -> DVector<f64> {
        self.family.mean()
    }

    /// Marginal standard deviations of q in unconstrained space.
    pub fn std_dev_unconstrained(&self) -> DVector<f64> {
        self.family.std_dev()
    }

    /// θ at the variational mean.
    pub fn mean_constrained(&self) -> Result<DVector<f64>, AdviError> {
        Ok(self.transform.inverse(&self.family.mean())?)
    }

    /// One constrained draw θ = T⁻¹(ζ), ζ ~ q.
    pub fn draw_posterior_sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<DVector<f64>, AdviError> {
        let zeta = self.family.sample(rng);
        Ok(self.transform.inverse(&zeta)?)
    }

    pub fn draw_posterior_samples<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<ApproxDraws, AdviError> {
        let samples = (0..n)
            .map(|_| self.draw_posterior_sample(rng))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ApproxDraws {
            names: self.transform.parameter_names(),
            samples,
        })
    }
}

/// ADVI driver.
///
/// # Usage
///
/// ```ignore
/// let specs = vec![ParameterSpec::scalar("sigma", Constraint::Positive)];
/// let fit = Advi::new(specs, model, AdviConfig::default())?.run()?;
/// let theta = fit.mean_constrained()?;
/// ```
pub struct Advi<M> {
    model: M,
    transform: Transform,
    config: AdviConfig,
    initial_mean: Option<DVector<f64>>,
    cancel: Option<Arc<AtomicBool>>,
}

/// Why a single iteration could not complete.
type IterationFailure = String;

impl<M: ModelEvaluator> Advi<M> {
    pub fn new(specs: Vec<ParameterSpec>, model: M, config: AdviConfig) -> Result<Self, AdviError> {
        config.validate()?;
        let transform = Transform::new(specs)?;
        Ok(Self {
            model,
            transform,
            config,
            initial_mean: None,
            cancel: None,
        })
    }

    /// Start the variational mean at `forward(theta)` instead of zero.
    pub fn with_initial_values(mut self, theta: &DVector<f64>) -> Result<Self, AdviError> {
        self.initial_mean = Some(self.transform.forward(theta)?);
        Ok(self)
    }

    /// Checked between iterations; once set, the run stops with
    /// [`ConvergenceStatus::Cancelled`].
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn config(&self) -> &AdviConfig {
        &self.config
    }

    pub fn run(&self) -> Result<AdviFit, AdviError> {
        match self.config.num_threads {
            Some(n) => {
                let n = n.min(num_cpus::get()).max(1);
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| AdviError::Config(format!("thread pool: {}", e)))?;
                pool.install(|| self.run_inner())
            }
            None => self.run_inner(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn initial_family(&self) -> GaussianFamily {
        match &self.initial_mean {
            Some(mu) => GaussianFamily::from_mean(self.config.family, mu),
            None => GaussianFamily::new(self.config.family, self.transform.dim()),
        }
    }

    fn estimator(&self) -> ElboEstimator {
        ElboEstimator::new(self.config.n_samples)
            .with_max_draw_retries(self.config.max_draw_retries)
            .with_jacobian(self.config.jacobian)
    }

    fn run_inner(&self) -> Result<AdviFit, AdviError> {
        let mut rng = SmallRng::seed_from_u64(self.config.random_seed);
        let estimator = self.estimator();
        let initial = self.initial_family();

        info!(
            "ADVI: {} family, {} unconstrained parameters, {} draws per gradient",
            self.config.family,
            self.transform.dim(),
            estimator.n_samples()
        );

        let eta = if self.config.adapt_engaged {
            match self.adapt_eta(&initial, &estimator, &mut rng)? {
                Some(eta) => eta,
                None => {
                    info!("cancelled during step-size adaptation");
                    return Ok(self.finish(
                        initial,
                        ConvergenceStatus::Cancelled,
                        0,
                        vec![],
                        None,
                        self.config.initial_step_size,
                        &estimator,
                        &mut rng,
                    ));
                }
            }
        } else {
            self.config.initial_step_size
        };

        let mut family = initial;
        let mut optimizer = StochasticOptimizer::new(self.config.schedule(eta));
        let mut monitor = ConvergenceMonitor::new(
            self.config.convergence_window_size,
            self.config.convergence_tolerance,
            self.config.max_iterations,
        );
        let mut elbo_trace = Vec::with_capacity(self.config.max_iterations.min(100_000));
        let mut last_elbo = None;
        let mut failed_at = 0;

        let pb = ProgressBar::new(self.config.max_iterations as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        monitor.start();
        while !monitor.phase().is_terminal() {
            if self.is_cancelled() {
                monitor.cancel();
                break;
            }

            match self.iterate(&mut family, &mut optimizer, &estimator, &mut rng) {
                Ok(Some(est)) => {
                    elbo_trace.push(est.value);
                    last_elbo = Some(est.value);
                    monitor.record_step(est.value, &est.gradient);
                    failed_at = monitor.iteration();
                }
                Ok(None) => {
                    elbo_trace.push(f64::NAN);
                    monitor.record(f64::NAN);
                    failed_at = monitor.iteration();
                }
                Err(reason) => {
                    failed_at = monitor.iteration() + 1;
                    monitor.fail(reason);
                }
            }
            pb.inc(1);

            if self.config.verbose {
                info!(
                    "iter {:5}: ELBO {:.4}, relative change {}",
                    monitor.iteration(),
                    elbo_trace.last().copied().unwrap_or(f64::NAN),
                    monitor
                        .window()
                        .relative_change()
                        .map_or_else(|| "-".to_string(), |d| format!("{:.5}", d))
                );
            }
        }
        pb.finish_and_clear();

        let status = match monitor.phase() {
            Phase::Converged => ConvergenceStatus::Converged,
            Phase::MaxIterationsReached => ConvergenceStatus::MaxIterationsReached,
            Phase::Cancelled => ConvergenceStatus::Cancelled,
            Phase::Failed(reason) => {
                warn!("ADVI failed at iteration {}: {}", failed_at, reason);
                return Err(AdviError::OptimizationFailure {
                    iteration: failed_at,
                    last_elbo,
                    reason: reason.clone(),
                });
            }
            Phase::Initializing | Phase::Iterating => {
                return Err(AdviError::OptimizationFailure {
                    iteration: monitor.iteration(),
                    last_elbo,
                    reason: "optimization stopped in a non-terminal state".into(),
                });
            }
        };

        let iterations = monitor.iteration();
        Ok(self.finish(
            family,
            status,
            iterations,
            elbo_trace,
            last_elbo,
            eta,
            &estimator,
            &mut rng,
        ))
    }

    /// One estimate-then-step cycle.
    ///
    /// Returns the ELBO estimate used for the update, or `None` when the
    /// estimate was not finite and φ was left unchanged. Fails when the
    /// update leaves φ or the variances of q non-finite.
    fn iterate(
        &self,
        family: &mut GaussianFamily,
        optimizer: &mut StochasticOptimizer,
        estimator: &ElboEstimator,
        rng: &mut SmallRng,
    ) -> Result<Option<ElboEstimate>, IterationFailure> {
        let mut retries = 0;
        let est = loop {
            match estimator.estimate(&*family, &self.transform, &self.model, rng) {
                Ok(est) => break est,
                Err(err) if retries < self.config.iteration_retries => {
                    retries += 1;
                    warn!(
                        "skipping iteration ({}), retry {}/{}",
                        err, retries, self.config.iteration_retries
                    );
                }
                Err(err) => return Err(err.to_string()),
            }
        };

        if !est.value.is_finite() || est.gradient.iter().any(|g| !g.is_finite()) {
            debug!("non-finite ELBO estimate {}; update skipped", est.value);
            return Ok(None);
        }

        let next = optimizer.step(family.parameters(), &est.gradient);
        if next.iter().any(|v| !v.is_finite()) {
            return Err("variational parameters diverged".into());
        }
        family.set_parameters(next).map_err(|e| e.to_string())?;
        if family.std_dev().iter().any(|sd| !(sd * sd).is_finite()) {
            return Err("variational parameters diverged: variance overflowed".into());
        }
        Ok(Some(est))
    }

    /// Pick η from [`ETA_SEQUENCE`] by running `adapt_iterations` steps from
    /// the initial family with each candidate.
    ///
    /// Returns `None` if cancelled.
    fn adapt_eta(
        &self,
        initial: &GaussianFamily,
        estimator: &ElboEstimator,
        rng: &mut SmallRng,
    ) -> Result<Option<f64>, AdviError> {
        let scorer = estimator.with_samples(self.config.elbo_samples);
        let elbo_init = scorer
            .estimate_value(initial, &self.transform, &self.model, rng)
            .map_err(|e| AdviError::OptimizationFailure {
                iteration: 0,
                last_elbo: None,
                reason: format!("cannot evaluate the initial ELBO: {}", e),
            })?;

        if !elbo_init.is_finite() {
            return Err(AdviError::OptimizationFailure {
                iteration: 0,
                last_elbo: None,
                reason: format!("initial ELBO is not finite ({})", elbo_init),
            });
        }
        debug!("step-size adaptation: initial ELBO {:.4}", elbo_init);

        let mut best: Option<(f64, f64)> = None;

        for &eta in ETA_SEQUENCE.iter() {
            if self.is_cancelled() {
                return Ok(None);
            }

            let mut family = initial.clone();
            let mut optimizer = StochasticOptimizer::new(self.config.schedule(eta));
            let mut ok = true;
            for _ in 0..self.config.adapt_iterations {
                if self.iterate(&mut family, &mut optimizer, estimator, rng).is_err() {
                    ok = false;
                    break;
                }
            }

            let elbo = if ok {
                scorer
                    .estimate_value(&family, &self.transform, &self.model, rng)
                    .ok()
                    .filter(|v| v.is_finite())
                    .unwrap_or(f64::NEG_INFINITY)
            } else {
                f64::NEG_INFINITY
            };
            debug!("step-size adaptation: eta = {}, ELBO {:.4}", eta, elbo);

            match best {
                Some((_, best_elbo)) if elbo <= best_elbo => {
                    if best_elbo > elbo_init {
                        break;
                    }
                }
                _ => best = Some((eta, elbo)),
            }
        }

        match best {
            Some((eta, best_elbo)) if best_elbo > elbo_init => {
                info!("step-size adaptation: eta = {} (ELBO {:.4})", eta, best_elbo);
                Ok(Some(eta))
            }
            _ => Err(AdviError::OptimizationFailure {
                iteration: 0,
                last_elbo: Some(elbo_init),
                reason: "no step size improved on the initial ELBO".into(),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        family: GaussianFamily,
        status: ConvergenceStatus,
        iterations: usize,
        elbo_trace: Vec<f64>,
        last_elbo: Option<f64>,
        eta: f64,
        estimator: &ElboEstimator,
        rng: &mut SmallRng,
    ) -> AdviFit {
        let final_elbo = match estimator
            .with_samples(self.config.elbo_samples)
            .estimate_value(&family, &self.transform, &self.model, rng)
        {
            Ok(v) => v,
            Err(err) => {
                warn!("final ELBO could not be evaluated: {}", err);
                last_elbo.unwrap_or(f64::NAN)
            }
        };

        match status {
            ConvergenceStatus::Converged => info!(
                "ADVI converged after {} iterations, ELBO {:.4}",
                iterations, final_elbo
            ),
            ConvergenceStatus::MaxIterationsReached => warn!(
                "maximum iterations reached ({}) before convergence, ELBO {:.4}",
                iterations, final_elbo
            ),
            ConvergenceStatus::Cancelled => {
                info!("ADVI cancelled after {} iterations", iterations)
            }
        }

        AdviFit {
            family,
            transform: self.transform.clone(),
            status,
            iterations,
            elbo_trace,
            final_elbo,
            eta,
        }
    }
}
