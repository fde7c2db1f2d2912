use advi_util::*;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn normal_config() -> AdviConfig {
    AdviConfig {
        adapt_engaged: false,
        initial_step_size: 1.0,
        max_iterations: 5000,
        convergence_window_size: 200,
        convergence_tolerance: 0.05,
        ..Default::default()
    }
}

/// log N(θ | 3, 1) up to a constant
fn normal_at_three(theta: &DVector<f64>) -> DensityResult {
    let d = theta[0] - 3.0;
    Ok((-0.5 * d * d, DVector::from_element(1, -d)))
}

/// log LogNormal(θ | m = 1, s = 0.5) up to a constant
fn log_normal(theta: &DVector<f64>) -> DensityResult {
    let (m, s2) = (1.0, 0.25);
    let x = theta[0];
    let z = x.ln() - m;
    let lp = -x.ln() - z * z / (2.0 * s2);
    let grad = -1.0 / x - z / (s2 * x);
    Ok((lp, DVector::from_element(1, grad)))
}

#[test]
fn recovers_a_normal_target() -> anyhow::Result<()> {
    init_logger();
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    let fit = Advi::new(specs, normal_at_three, normal_config())?.run()?;

    assert_ne!(fit.status, ConvergenceStatus::Cancelled);
    assert!(fit.iterations > 0);
    let mean = fit.mean_unconstrained();
    let sd = fit.std_dev_unconstrained();
    assert!((mean[0] - 3.0).abs() < 0.2, "mean {}", mean[0]);
    assert!((sd[0] - 1.0).abs() < 0.25, "sd {}", sd[0]);

    // ELBO of N(3, 1) against itself: H[q] - 0.5
    let optimum = 0.5 * (1.0 + (2.0 * std::f64::consts::PI).ln()) - 0.5;
    assert!((fit.final_elbo - optimum).abs() < 0.3, "ELBO {}", fit.final_elbo);

    let mut rng = SmallRng::seed_from_u64(17);
    let draws = fit.draw_posterior_samples(4000, &mut rng)?;
    assert!((draws.posterior_mean()[0] - 3.0).abs() < 0.25);
    assert!((draws.posterior_variance()[0].sqrt() - 1.0).abs() < 0.25);
    assert!((draws.quantile(0.5)?[0] - 3.0).abs() < 0.25);

    let one = fit.draw_posterior_sample(&mut rng)?;
    assert_eq!(one.len(), 1);
    Ok(())
}

#[test]
fn step_size_adaptation_reaches_the_same_answer() -> anyhow::Result<()> {
    init_logger();
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    let config = AdviConfig {
        adapt_engaged: true,
        ..normal_config()
    };
    let fit = Advi::new(specs, normal_at_three, config)?.run()?;
    assert!(advi_util::driver::ETA_SEQUENCE.contains(&fit.eta));
    assert!((fit.mean_unconstrained()[0] - 3.0).abs() < 0.5);
    Ok(())
}

#[test]
fn flat_elbo_trace_reports_convergence() -> anyhow::Result<()> {
    init_logger();
    let shifted = |theta: &DVector<f64>| -> DensityResult {
        let (lp, grad) = normal_at_three(theta)?;
        Ok((lp - 100.0, grad))
    };
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    let fit = Advi::new(specs, shifted, normal_config())?.run()?;

    assert_eq!(fit.status, ConvergenceStatus::Converged);
    assert!(fit.iterations >= 200 && fit.iterations < 5000);
    assert!((fit.mean_unconstrained()[0] - 3.0).abs() < 0.3);
    Ok(())
}

#[test]
fn jacobian_correction_matters() -> anyhow::Result<()> {
    init_logger();
    let specs = || vec![ParameterSpec::scalar("sigma", Constraint::Positive)];
    let config = AdviConfig {
        max_iterations: 3000,
        convergence_tolerance: 0.01,
        ..normal_config()
    };

    // with the correction, ζ = ln θ is exactly N(1, 0.5²)
    let with = Advi::new(specs(), log_normal, config.clone())?.run()?;
    let mu = with.mean_unconstrained()[0];
    let sd = with.std_dev_unconstrained()[0];
    assert!((mu - 1.0).abs() < 0.1, "mu {}", mu);
    assert!((sd - 0.5).abs() < 0.1, "sd {}", sd);
    assert!(with.mean_constrained()?[0] > 0.0);

    // without it the fit lands on the mode of -ζ - 2(ζ - 1)², i.e. 0.75
    let without = Advi::new(
        specs(),
        log_normal,
        AdviConfig {
            jacobian: false,
            ..config
        },
    )?
    .run()?;
    let mu_without = without.mean_unconstrained()[0];
    assert!((mu_without - 0.75).abs() < 0.1, "mu {}", mu_without);
    assert!(mu - mu_without > 0.1);
    Ok(())
}

fn assert_terminates_without_converging<M: ModelEvaluator>(model: M) {
    let specs = vec![ParameterSpec::scalar("x", Constraint::Real)];
    match Advi::new(specs, model, AdviConfig::default()).unwrap().run() {
        Ok(fit) => assert_eq!(
            fit.status,
            ConvergenceStatus::MaxIterationsReached,
            "mean {} sd {}",
            fit.mean_unconstrained()[0],
            fit.std_dev_unconstrained()[0]
        ),
        Err(AdviError::OptimizationFailure { .. }) => {}
        Err(other) => panic!("unexpected error: {}", other),
    }
}

#[test]
fn unbounded_quadratic_target_terminates() {
    init_logger();
    assert_terminates_without_converging(|theta: &DVector<f64>| -> DensityResult {
        Ok((theta[0] * theta[0], DVector::from_element(1, 2.0 * theta[0])))
    });
}

#[test]
fn unbounded_linear_target_terminates() {
    init_logger();
    assert_terminates_without_converging(|theta: &DVector<f64>| -> DensityResult {
        Ok((theta[0], DVector::from_element(1, 1.0)))
    });
}

#[test]
fn non_finite_elbo_for_a_full_window_fails() {
    init_logger();
    let calls = Arc::new(AtomicUsize::new(0));
    // two draws per iteration: the first 10 iterations see a proper density,
    // after that the two log densities of -f64::MAX sum to -inf
    let model = {
        let calls = calls.clone();
        move |theta: &DVector<f64>| -> DensityResult {
            if calls.fetch_add(1, Ordering::Relaxed) < 20 {
                normal_at_three(theta)
            } else {
                Ok((-f64::MAX, DVector::zeros(1)))
            }
        }
    };
    let config = AdviConfig {
        n_samples: 2,
        convergence_window_size: 20,
        ..normal_config()
    };
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    match Advi::new(specs, model, config).unwrap().run() {
        Err(AdviError::OptimizationFailure {
            iteration,
            last_elbo,
            reason,
        }) => {
            assert_eq!(iteration, 30);
            assert!(last_elbo.is_some_and(f64::is_finite));
            assert!(reason.contains("not finite"), "{}", reason);
        }
        other => panic!("expected an optimization failure, got {:?}", other.map(|f| f.status)),
    }
}

#[test]
fn model_that_starts_failing_reports_the_iteration() {
    init_logger();
    let calls = Arc::new(AtomicUsize::new(0));
    let model = {
        let calls = calls.clone();
        move |theta: &DVector<f64>| -> DensityResult {
            if calls.fetch_add(1, Ordering::Relaxed) < 100 {
                normal_at_three(theta)
            } else {
                Ok((f64::NAN, DVector::zeros(1)))
            }
        }
    };
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    match Advi::new(specs, model, normal_config()).unwrap().run() {
        Err(AdviError::OptimizationFailure {
            iteration,
            last_elbo,
            reason,
        }) => {
            // ten draws per iteration: iterations 1..=10 succeed
            assert_eq!(iteration, 11);
            assert!(last_elbo.is_some_and(f64::is_finite));
            assert!(reason.contains("non-finite log density"), "{}", reason);
        }
        other => panic!("expected an optimization failure, got {:?}", other.map(|f| f.status)),
    }
}

#[test]
fn full_rank_captures_correlation() -> anyhow::Result<()> {
    init_logger();
    // N((1, -1), [[1, 0.8], [0.8, 1]])
    let rho: f64 = 0.8;
    let det = 1.0 - rho * rho;
    let correlated = move |theta: &DVector<f64>| -> DensityResult {
        let (a, b) = (theta[0] - 1.0, theta[1] + 1.0);
        let pa = (a - rho * b) / det;
        let pb = (b - rho * a) / det;
        Ok((-0.5 * (a * pa + b * pb), DVector::from_vec(vec![-pa, -pb])))
    };

    let specs = || vec![ParameterSpec::new("x", Constraint::Real, 2)];
    let config = AdviConfig {
        n_samples: 20,
        max_iterations: 5000,
        convergence_tolerance: 0.01,
        ..normal_config()
    };

    let full = Advi::new(
        specs(),
        correlated,
        AdviConfig {
            family: FamilyKind::FullRank,
            ..config.clone()
        },
    )?
    .run()?;

    let cov = match full.family() {
        GaussianFamily::FullRank(q) => q.covariance(),
        other => panic!("expected a full-rank family, got {:?}", other.kind()),
    };
    let mean = full.mean_unconstrained();
    assert!((mean[0] - 1.0).abs() < 0.2 && (mean[1] + 1.0).abs() < 0.2);
    assert!((cov[(0, 1)] - rho).abs() < 0.25, "cov {}", cov);
    assert!((cov[(0, 0)] - 1.0).abs() < 0.3, "cov {}", cov);

    // the mean-field fit matches the conditional variance 1 - ρ²
    let mf = Advi::new(specs(), correlated, config)?.run()?;
    let sd = mf.std_dev_unconstrained();
    assert!((sd[0] - det.sqrt()).abs() < 0.15, "sd {}", sd);
    assert!(full.std_dev_unconstrained()[0] > sd[0]);
    Ok(())
}

#[test]
fn cancellation_returns_consistent_parameters() -> anyhow::Result<()> {
    init_logger();
    let flag = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let model = {
        let flag = flag.clone();
        let calls = calls.clone();
        move |theta: &DVector<f64>| -> DensityResult {
            if calls.fetch_add(1, Ordering::Relaxed) >= 2000 {
                flag.store(true, Ordering::Relaxed);
            }
            normal_at_three(theta)
        }
    };

    let config = AdviConfig {
        max_iterations: 100_000,
        convergence_tolerance: 1e-12,
        ..normal_config()
    };
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    let fit = Advi::new(specs, model, config)?
        .with_cancellation(flag.clone())
        .run()?;

    assert_eq!(fit.status, ConvergenceStatus::Cancelled);
    assert!(fit.iterations >= 200 && fit.iterations < 100_000);
    assert_eq!(fit.elbo_trace.len(), fit.iterations);
    assert!(fit.parameters().iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn cancellation_before_start_keeps_initial_values() -> anyhow::Result<()> {
    init_logger();
    let flag = Arc::new(AtomicBool::new(true));
    let specs = vec![ParameterSpec::scalar("s", Constraint::Positive)];
    let config = AdviConfig {
        adapt_engaged: true,
        ..normal_config()
    };
    let fit = Advi::new(specs, log_normal, config)?
        .with_initial_values(&DVector::from_element(1, 2.0))?
        .with_cancellation(flag)
        .run()?;

    assert_eq!(fit.status, ConvergenceStatus::Cancelled);
    assert_eq!(fit.iterations, 0);
    assert!((fit.mean_constrained()?[0] - 2.0).abs() < 1e-12);
    Ok(())
}

#[test]
fn sporadic_evaluation_failures_are_absorbed() -> anyhow::Result<()> {
    init_logger();
    let flaky = |theta: &DVector<f64>| -> DensityResult {
        if (theta[0] - 3.0).abs() > 2.5 {
            Err(EvaluationError::OutOfSupport(format!("{} is too far out", theta[0])))
        } else {
            normal_at_three(theta)
        }
    };
    let specs = vec![ParameterSpec::scalar("mu", Constraint::Real)];
    let config = AdviConfig {
        max_draw_retries: 10,
        iteration_retries: 3,
        ..normal_config()
    };
    let fit = Advi::new(specs, flaky, config)?
        .with_initial_values(&DVector::from_element(1, 3.0))?
        .run()?;
    assert!((fit.mean_unconstrained()[0] - 3.0).abs() < 0.2);
    Ok(())
}

#[test]
fn constrained_vector_parameters() -> anyhow::Result<()> {
    init_logger();
    // Dirichlet(4, 2, 2) on a 3-simplex plus an interval-bounded scalar
    let alpha = [4.0, 2.0, 2.0];
    let model = move |theta: &DVector<f64>| -> DensityResult {
        let mut lp = 0.0;
        let mut grad = DVector::zeros(4);
        for k in 0..3 {
            lp += (alpha[k] - 1.0) * theta[k].ln();
            grad[k] = (alpha[k] - 1.0) / theta[k];
        }
        // flat on (0, 1)
        Ok((lp, grad))
    };
    let specs = vec![
        ParameterSpec::new("p", Constraint::Simplex, 3),
        ParameterSpec::scalar("u", Constraint::Interval { lower: 0.0, upper: 1.0 }),
    ];
    let config = AdviConfig {
        max_iterations: 3000,
        ..normal_config()
    };
    let fit = Advi::new(specs, model, config)?.run()?;

    let mut rng = SmallRng::seed_from_u64(3);
    let draws = fit.draw_posterior_samples(2000, &mut rng)?;
    assert_eq!(
        draws.names.iter().map(|n| n.as_ref()).collect::<Vec<_>>(),
        vec!["p.1", "p.2", "p.3", "u"]
    );
    for s in &draws.samples {
        let total: f64 = s.rows(0, 3).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(s[3] > 0.0 && s[3] < 1.0);
    }
    // Dirichlet mean (0.5, 0.25, 0.25)
    let mean = draws.posterior_mean();
    assert!((mean[0] - 0.5).abs() < 0.1, "mean {}", mean);
    assert!((mean[3] - 0.5).abs() < 0.1, "mean {}", mean);
    Ok(())
}
