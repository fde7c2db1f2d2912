use nalgebra::DVector;
use std::collections::VecDeque;

/// z-score of the newer half-window mean over the older one above which the
/// ELBO is still climbing.
const ELBO_TREND_Z: f64 = 3.0;

/// z-score of a window-averaged gradient coordinate above which φ is still
/// being pushed in one direction.
const GRADIENT_DRIFT_Z: f64 = 4.0;

/// Mean, sample variance and count.
fn mean_var<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64, usize) {
    let values: Vec<f64> = values.copied().collect();
    let n = values.len();
    if n == 0 {
        return (0.0, 0.0, 0);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = if n > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    (mean, var, n)
}

/// Ring buffer of the most recent finite ELBO values.
///
/// Once full, the run is considered converged when the mean of the newer half
/// has moved by less than `tolerance` relative to the mean of the older half,
/// and the newer half is not significantly above the older one.
#[derive(Debug, Clone)]
pub struct ConvergenceWindow {
    buffer: VecDeque<f64>,
    capacity: usize,
    tolerance: f64,
}

impl ConvergenceWindow {
    pub fn new(capacity: usize, tolerance: f64) -> Self {
        let capacity = capacity.max(2);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            tolerance,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Adds a value, evicting the oldest one when full. Non-finite values are
    /// refused and `false` is returned.
    pub fn push(&mut self, elbo: f64) -> bool {
        if !elbo.is_finite() {
            return false;
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(elbo);
        true
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn mean(&self) -> Option<f64> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.iter().sum::<f64>() / self.buffer.len() as f64)
        }
    }

    /// `|m₂ - m₁| / max(|m₂|, 1e-12)` over the two halves of a full window.
    pub fn relative_change(&self) -> Option<f64> {
        if !self.is_full() {
            return None;
        }
        let half = self.capacity / 2;
        let older = self.buffer.iter().take(half);
        let newer = self.buffer.iter().skip(half);
        let m1 = older.sum::<f64>() / half as f64;
        let m2 = newer.sum::<f64>() / (self.capacity - half) as f64;
        Some((m2 - m1).abs() / m2.abs().max(1e-12))
    }

    /// Whether the newer half of a full window sits more than
    /// `ELBO_TREND_Z` standard errors above the older half.
    pub fn is_trending_up(&self) -> bool {
        if !self.is_full() {
            return false;
        }
        let half = self.capacity / 2;
        let (m1, v1, n1) = mean_var(self.buffer.iter().take(half));
        let (m2, v2, n2) = mean_var(self.buffer.iter().skip(half));
        let diff = m2 - m1;
        let se = (v1 / n1 as f64 + v2 / n2 as f64).sqrt();
        if se > 0.0 {
            diff > ELBO_TREND_Z * se
        } else {
            diff > 0.0
        }
    }

    pub fn is_converged(&self) -> bool {
        self.relative_change()
            .is_some_and(|delta| delta < self.tolerance)
            && !self.is_trending_up()
    }
}

/// Ring buffer of the most recent ELBO gradients.
///
/// At a stationary point of the ELBO every gradient coordinate averages to
/// zero. A coordinate whose window mean stays many standard errors away from
/// zero means the optimizer is still moving, for instance towards infinity on
/// a target that is unbounded above.
#[derive(Debug, Clone)]
pub struct GradientWindow {
    buffer: VecDeque<DVector<f64>>,
    capacity: usize,
}

impl GradientWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Adds a gradient, evicting the oldest one when full. Gradients with a
    /// non-finite entry are refused and `false` is returned.
    pub fn push(&mut self, gradient: &DVector<f64>) -> bool {
        if gradient.iter().any(|g| !g.is_finite()) {
            return false;
        }
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(gradient.clone());
        true
    }

    /// Largest `|mean| / standard error` over the coordinates of a full
    /// window. Infinite when a coordinate is constant and non-zero.
    pub fn max_drift(&self) -> Option<f64> {
        if !self.is_full() {
            return None;
        }
        let dim = self.buffer.front().map_or(0, |g| g.len());
        let mut worst: f64 = 0.0;
        for k in 0..dim {
            let column: Vec<f64> = self.buffer.iter().map(|g| g[k]).collect();
            let (mean, var, n) = mean_var(column.iter());
            let se = (var / n as f64).sqrt();
            let z = if se > 0.0 {
                mean.abs() / se
            } else if mean != 0.0 {
                f64::INFINITY
            } else {
                0.0
            };
            worst = worst.max(z);
        }
        Some(worst)
    }

    pub fn is_drifting(&self) -> bool {
        self.max_drift().is_some_and(|z| z > GRADIENT_DRIFT_Z)
    }
}

/// Optimization state machine.
///
/// ```text
/// Initializing -> Iterating -> Converged
///                           -> MaxIterationsReached
///                           -> Cancelled
///                           -> Failed
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Initializing,
    Iterating,
    Converged,
    MaxIterationsReached,
    Cancelled,
    Failed(String),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Phase::Initializing | Phase::Iterating)
    }
}

/// Feeds per-iteration ELBO values through a [`ConvergenceWindow`] and moves
/// the [`Phase`] forward.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    window: ConvergenceWindow,
    gradients: GradientWindow,
    max_iterations: usize,
    iteration: usize,
    non_finite_streak: usize,
    phase: Phase,
}

impl ConvergenceMonitor {
    pub fn new(window_size: usize, tolerance: f64, max_iterations: usize) -> Self {
        Self {
            window: ConvergenceWindow::new(window_size, tolerance),
            gradients: GradientWindow::new(window_size),
            max_iterations,
            iteration: 0,
            non_finite_streak: 0,
            phase: Phase::Initializing,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Completed iterations, including those whose ELBO was not finite.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn window(&self) -> &ConvergenceWindow {
        &self.window
    }

    pub fn start(&mut self) {
        if self.phase == Phase::Initializing {
            self.phase = if self.max_iterations == 0 {
                Phase::MaxIterationsReached
            } else {
                Phase::Iterating
            };
        }
    }

    pub fn gradients(&self) -> &GradientWindow {
        &self.gradients
    }

    /// Records one finished iteration together with the gradient used for
    /// its update.
    ///
    /// Once gradients are recorded, the run only converges while none of
    /// their coordinates drifts.
    pub fn record_step(&mut self, elbo: f64, gradient: &DVector<f64>) -> &Phase {
        if !self.phase.is_terminal() {
            self.gradients.push(gradient);
        }
        self.record(elbo)
    }

    /// Records the ELBO of one finished iteration and returns the new phase.
    ///
    /// A run of non-finite values as long as the window fails the run.
    pub fn record(&mut self, elbo: f64) -> &Phase {
        if self.phase.is_terminal() {
            return &self.phase;
        }
        self.phase = Phase::Iterating;
        self.iteration += 1;

        if self.window.push(elbo) {
            self.non_finite_streak = 0;
        } else {
            self.non_finite_streak += 1;
            if self.non_finite_streak >= self.window.capacity() {
                self.phase = Phase::Failed(format!(
                    "ELBO was not finite for {} consecutive iterations",
                    self.non_finite_streak
                ));
                return &self.phase;
            }
        }

        if self.window.is_converged() && !self.gradients.is_drifting() {
            self.phase = Phase::Converged;
        } else if self.iteration >= self.max_iterations {
            self.phase = Phase::MaxIterationsReached;
        }
        &self.phase
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed(reason.into());
        }
    }

    pub fn cancel(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Cancelled;
        }
    }
}
