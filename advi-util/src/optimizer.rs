use nalgebra::DVector;

/// Per-coordinate adaptive step size
///
/// ```text
/// s_1 = g_1²,  s_t = α g_t² + (1 - α) s_{t-1}
/// ρ_t = η t^(-decay) / (τ + √s_t)
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSizeSchedule {
    pub eta: f64,
    pub tau: f64,
    pub alpha: f64,
    pub decay: f64,
}

impl Default for StepSizeSchedule {
    fn default() -> Self {
        Self {
            eta: 1.0,
            tau: 1.0,
            alpha: 0.1,
            decay: 0.51,
        }
    }
}

impl StepSizeSchedule {
    pub fn with_eta(self, eta: f64) -> Self {
        Self { eta, ..self }
    }
}

/// Squared-gradient history and iteration counter.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    sq_grad: Option<DVector<f64>>,
    iteration: usize,
}

impl OptimizerState {
    pub fn iteration(&self) -> usize {
        self.iteration
    }
}

/// Stochastic gradient ascent on the ELBO.
#[derive(Debug, Clone)]
pub struct StochasticOptimizer {
    schedule: StepSizeSchedule,
    state: OptimizerState,
}

impl StochasticOptimizer {
    pub fn new(schedule: StepSizeSchedule) -> Self {
        Self {
            schedule,
            state: OptimizerState::default(),
        }
    }

    pub fn schedule(&self) -> &StepSizeSchedule {
        &self.schedule
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Forget the gradient history and restart the decay sequence.
    pub fn reset(&mut self) {
        self.state = OptimizerState::default();
    }

    /// Step sizes ρ_t for gradient `grad`, updating the history.
    pub fn step_sizes(&mut self, grad: &DVector<f64>) -> DVector<f64> {
        let StepSizeSchedule {
            eta,
            tau,
            alpha,
            decay,
        } = self.schedule;

        self.state.iteration += 1;
        let g2 = grad.map(|g| g * g);
        let s = match self.state.sq_grad.take() {
            Some(prev) if prev.len() == g2.len() => g2 * alpha + prev * (1.0 - alpha),
            _ => g2,
        };

        let scale = eta * (self.state.iteration as f64).powf(-decay);
        let rho = s.map(|v| scale / (tau + v.sqrt()));
        self.state.sq_grad = Some(s);
        rho
    }

    /// `φ + ρ_t ∘ g_t`
    pub fn step(&mut self, params: &DVector<f64>, grad: &DVector<f64>) -> DVector<f64> {
        let rho = self.step_sizes(grad);
        params + rho.component_mul(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn first_step_uses_raw_squared_gradient() {
        let mut opt = StochasticOptimizer::new(StepSizeSchedule::default().with_eta(0.5));
        let phi = DVector::from_vec(vec![1.0, 2.0]);
        let g = DVector::from_vec(vec![3.0, -1.0]);
        let next = opt.step(&phi, &g);
        // ρ = 0.5 / (1 + |g|)
        assert_abs_diff_eq!(next[0], 1.0 + 0.5 / 4.0 * 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(next[1], 2.0 - 0.5 / 2.0, epsilon = 1e-12);
        assert_eq!(opt.state().iteration(), 1);
    }

    #[test]
    fn history_is_exponentially_weighted() {
        let sched = StepSizeSchedule::default();
        let mut opt = StochasticOptimizer::new(sched);
        let g1 = DVector::from_element(1, 2.0);
        let g2 = DVector::from_element(1, 1.0);
        opt.step_sizes(&g1);
        let rho = opt.step_sizes(&g2);

        let s = 0.1 * 1.0 + 0.9 * 4.0;
        let expected = 2f64.powf(-0.51) / (1.0 + f64::sqrt(s));
        assert_abs_diff_eq!(rho[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn step_sizes_decay_for_constant_gradient() {
        let mut opt = StochasticOptimizer::new(StepSizeSchedule::default());
        let g = DVector::from_element(3, 0.7);
        let mut prev = f64::INFINITY;
        for _ in 0..20 {
            let rho = opt.step_sizes(&g);
            assert!(rho[0] < prev);
            prev = rho[0];
        }
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut opt = StochasticOptimizer::new(StepSizeSchedule::default());
        let g = DVector::from_element(2, 5.0);
        let first = opt.step_sizes(&g);
        opt.step_sizes(&DVector::from_element(2, 0.1));
        opt.reset();
        assert_eq!(opt.state().iteration(), 0);
        assert_abs_diff_eq!(opt.step_sizes(&g), first, epsilon = 1e-15);
    }

    #[test]
    fn ascends_a_concave_objective() {
        // f(φ) = -|φ - c|²
        let c = DVector::from_vec(vec![3.0, -2.0]);
        let mut phi = DVector::zeros(2);
        let mut opt = StochasticOptimizer::new(StepSizeSchedule::default());
        for _ in 0..2000 {
            let grad = (&c - &phi) * 2.0;
            phi = opt.step(&phi, &grad);
        }
        assert_abs_diff_eq!(phi, c, epsilon = 1e-2);
    }
}
