//! Change of variables between constrained parameters `θ` and unconstrained
//! coordinates `ζ ∈ ℝᴷ`.
//!
//! `forward` maps θ → ζ, `inverse` maps ζ → θ, and
//! `log_det_jacobian_inverse` gives `log |det ∂θ/∂ζ|`, the term that keeps a
//! density defined on θ unbiased when it is optimized over ζ.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

/// Tolerance on `|Σθ − 1|` accepted for a simplex.
const SIMPLEX_SUM_TOL: f64 = 1e-8;

/// Support of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// `(-∞, ∞)`, identity map
    Real,
    /// `(0, ∞)`, `θ = exp(ζ)`
    Positive,
    /// `(a, ∞)`, `θ = a + exp(ζ)`
    LowerBounded { lower: f64 },
    /// `(-∞, b)`, `θ = b - exp(ζ)`
    UpperBounded { upper: f64 },
    /// `(a, b)`, `θ = a + (b - a) sigmoid(ζ)`
    Interval { lower: f64, upper: f64 },
    /// Positive entries summing to one; stick-breaking over `dim - 1` coordinates
    Simplex,
    /// Strictly increasing vector; `θ₁ = ζ₁`, `θₖ = θₖ₋₁ + exp(ζₖ)`
    Ordered,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Real => write!(f, "real"),
            Constraint::Positive => write!(f, "positive"),
            Constraint::LowerBounded { lower } => write!(f, "lower-bounded({})", lower),
            Constraint::UpperBounded { upper } => write!(f, "upper-bounded({})", upper),
            Constraint::Interval { lower, upper } => write!(f, "interval({}, {})", lower, upper),
            Constraint::Simplex => write!(f, "simplex"),
            Constraint::Ordered => write!(f, "ordered"),
        }
    }
}

/// One declared model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub constraint: Constraint,
    /// Number of constrained values, at least 1 (at least 2 for a simplex)
    pub dim: usize,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, constraint: Constraint, dim: usize) -> Self {
        Self {
            name: name.into(),
            constraint,
            dim,
        }
    }

    pub fn scalar(name: impl Into<String>, constraint: Constraint) -> Self {
        Self::new(name, constraint, 1)
    }

    /// Number of unconstrained coordinates this parameter occupies.
    pub fn unconstrained_dim(&self) -> usize {
        match self.constraint {
            Constraint::Simplex => self.dim.saturating_sub(1),
            _ => self.dim,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let invalid = |reason: String| DomainError::InvalidSpec {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("empty identifier".into()));
        }
        if self.dim == 0 {
            return Err(invalid("dimensionality must be at least 1".into()));
        }

        match self.constraint {
            Constraint::LowerBounded { lower } if !lower.is_finite() => {
                Err(invalid(format!("lower bound {} is not finite", lower)))
            }
            Constraint::UpperBounded { upper } if !upper.is_finite() => {
                Err(invalid(format!("upper bound {} is not finite", upper)))
            }
            Constraint::Interval { lower, upper } => {
                if !lower.is_finite() || !upper.is_finite() {
                    Err(invalid(format!(
                        "interval bounds ({}, {}) must be finite",
                        lower, upper
                    )))
                } else if lower >= upper {
                    Err(invalid(format!(
                        "interval lower bound {} must be below upper bound {}",
                        lower, upper
                    )))
                } else {
                    Ok(())
                }
            }
            Constraint::Simplex if self.dim < 2 => {
                Err(invalid("a simplex needs at least 2 entries".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct Block {
    spec: ParameterSpec,
    theta_offset: usize,
    zeta_offset: usize,
}

impl Block {
    fn theta<'a>(&self, theta: &'a [f64]) -> &'a [f64] {
        &theta[self.theta_offset..self.theta_offset + self.spec.dim]
    }

    fn zeta<'a>(&self, zeta: &'a [f64]) -> &'a [f64] {
        &zeta[self.zeta_offset..self.zeta_offset + self.spec.unconstrained_dim()]
    }
}

/// Immutable bijection derived from an ordered list of [`ParameterSpec`].
#[derive(Debug, Clone)]
pub struct Transform {
    blocks: Vec<Block>,
    constrained_dim: usize,
    unconstrained_dim: usize,
}

impl Transform {
    pub fn new(specs: Vec<ParameterSpec>) -> Result<Self, DomainError> {
        if specs.is_empty() {
            return Err(DomainError::InvalidSpec {
                name: "<model>".into(),
                reason: "no parameters declared".into(),
            });
        }

        let mut blocks = Vec::with_capacity(specs.len());
        let mut theta_offset = 0;
        let mut zeta_offset = 0;

        for spec in specs {
            spec.validate()?;
            if blocks.iter().any(|b: &Block| b.spec.name == spec.name) {
                return Err(DomainError::InvalidSpec {
                    name: spec.name,
                    reason: "duplicate identifier".into(),
                });
            }
            let (d, k) = (spec.dim, spec.unconstrained_dim());
            blocks.push(Block {
                spec,
                theta_offset,
                zeta_offset,
            });
            theta_offset += d;
            zeta_offset += k;
        }

        Ok(Self {
            blocks,
            constrained_dim: theta_offset,
            unconstrained_dim: zeta_offset,
        })
    }

    /// Number of unconstrained coordinates K.
    pub fn dim(&self) -> usize {
        self.unconstrained_dim
    }

    /// Number of constrained values.
    pub fn constrained_dim(&self) -> usize {
        self.constrained_dim
    }

    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.blocks.iter().map(|b| &b.spec)
    }

    /// Flattened constrained names: `name` for scalars, `name.1`, `name.2`, ...
    /// for vectors.
    pub fn parameter_names(&self) -> Vec<Box<str>> {
        let mut names = Vec::with_capacity(self.constrained_dim);
        for b in &self.blocks {
            if b.spec.dim == 1 {
                names.push(b.spec.name.clone().into_boxed_str());
            } else {
                for i in 0..b.spec.dim {
                    names.push(format!("{}.{}", b.spec.name, i + 1).into_boxed_str());
                }
            }
        }
        names
    }

    /// θ → ζ. Fails outside the admissible domain.
    pub fn forward(&self, theta: &DVector<f64>) -> Result<DVector<f64>, DomainError> {
        check_len(theta.len(), self.constrained_dim)?;
        let theta = theta.as_slice();
        let mut zeta = DVector::zeros(self.unconstrained_dim);
        for b in &self.blocks {
            let out = &mut zeta.as_mut_slice()
                [b.zeta_offset..b.zeta_offset + b.spec.unconstrained_dim()];
            free_block(&b.spec, b.theta(theta), out)?;
        }
        Ok(zeta)
    }

    /// ζ → θ.
    ///
    /// Where the map saturates in floating point (an interval endpoint, a
    /// zero simplex entry, ...) the value is moved to the nearest
    /// representable point inside the support, so `forward` accepts every
    /// output.
    pub fn inverse(&self, zeta: &DVector<f64>) -> Result<DVector<f64>, DomainError> {
        check_len(zeta.len(), self.unconstrained_dim)?;
        let zeta = zeta.as_slice();
        let mut theta = DVector::zeros(self.constrained_dim);
        for b in &self.blocks {
            let out = &mut theta.as_mut_slice()[b.theta_offset..b.theta_offset + b.spec.dim];
            constrain_block(&b.spec.constraint, b.zeta(zeta), out);
        }
        Ok(theta)
    }

    /// `log |det ∂θ/∂ζ|` of the inverse map at ζ, summed over parameters.
    pub fn log_det_jacobian_inverse(&self, zeta: &DVector<f64>) -> Result<f64, DomainError> {
        check_len(zeta.len(), self.unconstrained_dim)?;
        let zeta = zeta.as_slice();
        Ok(self
            .blocks
            .iter()
            .map(|b| log_det_block(&b.spec.constraint, b.zeta(zeta)))
            .sum())
    }

    /// Chain rule through the inverse map.
    ///
    /// Given `∂f/∂θ` at `θ = inverse(ζ)`, returns `∂/∂ζ [f(inverse(ζ))]`, plus
    /// `∂/∂ζ log |det J(ζ)|` when `jacobian` is set.
    pub fn gradient_unconstrained(
        &self,
        zeta: &DVector<f64>,
        grad_theta: &DVector<f64>,
        jacobian: bool,
    ) -> Result<DVector<f64>, DomainError> {
        check_len(zeta.len(), self.unconstrained_dim)?;
        check_len(grad_theta.len(), self.constrained_dim)?;
        let (zeta, grad_theta) = (zeta.as_slice(), grad_theta.as_slice());
        let mut grad = DVector::zeros(self.unconstrained_dim);
        for b in &self.blocks {
            let out = &mut grad.as_mut_slice()
                [b.zeta_offset..b.zeta_offset + b.spec.unconstrained_dim()];
            pull_back_block(
                &b.spec.constraint,
                b.zeta(zeta),
                b.theta(grad_theta),
                jacobian,
                out,
            );
        }
        Ok(grad)
    }
}

fn check_len(actual: usize, expected: usize) -> Result<(), DomainError> {
    if actual != expected {
        return Err(DomainError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

//
// numerically stable helpers
//

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

fn logit(p: f64) -> f64 {
    p.ln() - (-p).ln_1p()
}

//
// per-constraint maps
//

fn free_block(spec: &ParameterSpec, theta: &[f64], out: &mut [f64]) -> Result<(), DomainError> {
    let out_of_support = |index: usize, value: f64| DomainError::OutOfSupport {
        name: spec.name.clone(),
        index,
        value,
        constraint: spec.constraint.to_string(),
    };

    if let Some((i, &v)) = theta.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(out_of_support(i, v));
    }

    match spec.constraint {
        Constraint::Real => out.copy_from_slice(theta),
        Constraint::Positive => {
            for (i, (&t, z)) in theta.iter().zip(out.iter_mut()).enumerate() {
                if t <= 0.0 {
                    return Err(out_of_support(i, t));
                }
                *z = t.ln();
            }
        }
        Constraint::LowerBounded { lower } => {
            for (i, (&t, z)) in theta.iter().zip(out.iter_mut()).enumerate() {
                if t <= lower {
                    return Err(out_of_support(i, t));
                }
                *z = (t - lower).ln();
            }
        }
        Constraint::UpperBounded { upper } => {
            for (i, (&t, z)) in theta.iter().zip(out.iter_mut()).enumerate() {
                if t >= upper {
                    return Err(out_of_support(i, t));
                }
                *z = (upper - t).ln();
            }
        }
        Constraint::Interval { lower, upper } => {
            let width = upper - lower;
            for (i, (&t, z)) in theta.iter().zip(out.iter_mut()).enumerate() {
                if t <= lower || t >= upper {
                    return Err(out_of_support(i, t));
                }
                *z = logit((t - lower) / width);
            }
        }
        Constraint::Simplex => {
            if let Some((i, &v)) = theta.iter().enumerate().find(|(_, v)| **v <= 0.0) {
                return Err(out_of_support(i, v));
            }
            let total: f64 = theta.iter().sum();
            if (total - 1.0).abs() > SIMPLEX_SUM_TOL {
                return Err(DomainError::InvalidValue {
                    name: spec.name.clone(),
                    constraint: spec.constraint.to_string(),
                    reason: format!("entries sum to {}", total),
                });
            }
            let m = theta.len() - 1;
            let mut stick = theta[m];
            for k in (0..m).rev() {
                stick += theta[k];
                out[k] = logit(theta[k] / stick) + ((m - k) as f64).ln();
            }
        }
        Constraint::Ordered => {
            out[0] = theta[0];
            for k in 1..theta.len() {
                let gap = theta[k] - theta[k - 1];
                if gap <= 0.0 {
                    return Err(DomainError::InvalidValue {
                        name: spec.name.clone(),
                        constraint: spec.constraint.to_string(),
                        reason: format!("entry {} is not above entry {}", k, k - 1),
                    });
                }
                out[k] = gap.ln();
            }
        }
    }
    Ok(())
}

/// ζ → θ for one block. Saturated values are nudged back inside the
/// support so that `free_block` accepts every output.
fn constrain_block(constraint: &Constraint, zeta: &[f64], out: &mut [f64]) {
    match *constraint {
        Constraint::Real => out.copy_from_slice(zeta),
        Constraint::Positive => {
            for (t, &z) in out.iter_mut().zip(zeta) {
                *t = z.exp().max(0.0f64.next_up());
            }
        }
        Constraint::LowerBounded { lower } => {
            for (t, &z) in out.iter_mut().zip(zeta) {
                *t = (lower + z.exp()).max(lower.next_up());
            }
        }
        Constraint::UpperBounded { upper } => {
            for (t, &z) in out.iter_mut().zip(zeta) {
                *t = (upper - z.exp()).min(upper.next_down());
            }
        }
        Constraint::Interval { lower, upper } => {
            let width = upper - lower;
            for (t, &z) in out.iter_mut().zip(zeta) {
                *t = (lower + width * sigmoid(z))
                    .max(lower.next_up())
                    .min(upper.next_down());
            }
        }
        Constraint::Simplex => {
            let m = zeta.len();
            let mut stick = 1.0;
            for k in 0..m {
                let adj = zeta[k] - ((m - k) as f64).ln();
                out[k] = (stick * sigmoid(adj)).max(f64::MIN_POSITIVE);
                stick *= sigmoid(-adj);
            }
            out[m] = stick.max(f64::MIN_POSITIVE);
        }
        Constraint::Ordered => {
            out[0] = zeta[0];
            for k in 1..zeta.len() {
                out[k] = (out[k - 1] + zeta[k].exp()).max(out[k - 1].next_up());
            }
        }
    }
}

fn log_det_block(constraint: &Constraint, zeta: &[f64]) -> f64 {
    match *constraint {
        Constraint::Real => 0.0,
        Constraint::Positive
        | Constraint::LowerBounded { .. }
        | Constraint::UpperBounded { .. } => zeta.iter().sum(),
        Constraint::Interval { lower, upper } => {
            let log_width = (upper - lower).ln();
            zeta.iter()
                .map(|&z| log_width + log_sigmoid(z) + log_sigmoid(-z))
                .sum()
        }
        Constraint::Simplex => {
            let m = zeta.len();
            let mut log_stick = 0.0;
            let mut lp = 0.0;
            for k in 0..m {
                let adj = zeta[k] - ((m - k) as f64).ln();
                lp += log_stick + log_sigmoid(adj) + log_sigmoid(-adj);
                log_stick += log_sigmoid(-adj);
            }
            lp
        }
        Constraint::Ordered => zeta.iter().skip(1).sum(),
    }
}

fn pull_back_block(
    constraint: &Constraint,
    zeta: &[f64],
    grad_theta: &[f64],
    jacobian: bool,
    out: &mut [f64],
) {
    let jac = if jacobian { 1.0 } else { 0.0 };
    match *constraint {
        Constraint::Real => out.copy_from_slice(grad_theta),
        Constraint::Positive | Constraint::LowerBounded { .. } => {
            for ((o, &z), &g) in out.iter_mut().zip(zeta).zip(grad_theta) {
                *o = g * z.exp() + jac;
            }
        }
        Constraint::UpperBounded { .. } => {
            for ((o, &z), &g) in out.iter_mut().zip(zeta).zip(grad_theta) {
                *o = -g * z.exp() + jac;
            }
        }
        Constraint::Interval { lower, upper } => {
            let width = upper - lower;
            for ((o, &z), &g) in out.iter_mut().zip(zeta).zip(grad_theta) {
                let s = sigmoid(z);
                *o = g * width * s * (1.0 - s) + jac * (1.0 - 2.0 * s);
            }
        }
        Constraint::Simplex => {
            // x_k = s_k z_k, s_{k+1} = s_k (1 - z_k), x_m = s_m;
            // reverse sweep carrying the adjoint of the remaining stick
            let m = zeta.len();
            let mut stick = Vec::with_capacity(m);
            let mut frac = Vec::with_capacity(m);
            let mut s = 1.0;
            for (k, &y) in zeta.iter().enumerate() {
                let adj = y - ((m - k) as f64).ln();
                stick.push(s);
                frac.push(sigmoid(adj));
                s *= sigmoid(-adj);
            }

            let mut stick_adj = grad_theta[m];
            for k in (0..m).rev() {
                let (s_k, z_k) = (stick[k], frac[k]);
                let x_adj = grad_theta[k];
                out[k] = s_k * (x_adj - stick_adj) * z_k * (1.0 - z_k) + jac * (1.0 - 2.0 * z_k);
                stick_adj = x_adj * z_k + stick_adj * (1.0 - z_k) + jac / s_k;
            }
        }
        Constraint::Ordered => {
            let mut tail = 0.0;
            for k in (0..zeta.len()).rev() {
                tail += grad_theta[k];
                out[k] = if k == 0 {
                    tail
                } else {
                    tail * zeta[k].exp() + jac
                };
            }
        }
    }
}
