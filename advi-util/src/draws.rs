use nalgebra::DVector;

/// Constrained draws from a fitted approximation, one vector per draw.
#[derive(Debug, Clone)]
pub struct ApproxDraws {
    pub names: Vec<Box<str>>,
    pub samples: Vec<DVector<f64>>,
}

impl ApproxDraws {
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    /// All draws of one named coordinate (`mu`, `beta.2`, ...).
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.names.iter().position(|n| n.as_ref() == name)?;
        Some(self.samples.iter().map(|s| s[j]).collect())
    }

    /// Element-wise mean across draws.
    pub fn posterior_mean(&self) -> DVector<f64> {
        let n = self.n_samples();
        if n == 0 {
            return DVector::zeros(0);
        }
        let mut mean = DVector::zeros(self.dim());
        for s in &self.samples {
            mean += s;
        }
        mean / n as f64
    }

    /// Element-wise sample variance across draws.
    pub fn posterior_variance(&self) -> DVector<f64> {
        let n = self.n_samples();
        if n < 2 {
            return DVector::zeros(0);
        }
        let mean = self.posterior_mean();
        let mut var = DVector::zeros(self.dim());
        for s in &self.samples {
            let diff = s - &mean;
            var += diff.component_mul(&diff);
        }
        var / (n - 1) as f64
    }

    /// Element-wise quantile, linearly interpolated. Fails unless
    /// `0 <= q <= 1`.
    pub fn quantile(&self, q: f64) -> anyhow::Result<DVector<f64>> {
        anyhow::ensure!((0.0..=1.0).contains(&q), "quantile level {} is not in [0, 1]", q);
        let n = self.n_samples();
        if n == 0 {
            return Ok(DVector::zeros(0));
        }
        let idx = q * (n - 1) as f64;
        let lo = idx.floor() as usize;
        let hi = idx.ceil() as usize;
        let frac = idx - lo as f64;

        Ok(DVector::from_fn(self.dim(), |i, _| {
            let mut vals: Vec<f64> = self.samples.iter().map(|s| s[i]).collect();
            vals.sort_unstable_by(|a, b| a.total_cmp(b));
            if lo == hi {
                vals[lo]
            } else {
                vals[lo] * (1.0 - frac) + vals[hi] * frac
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn draws() -> ApproxDraws {
        ApproxDraws {
            names: vec!["a".into(), "b.1".into()],
            samples: (0..5)
                .map(|i| DVector::from_vec(vec![i as f64, 10.0 - 2.0 * i as f64]))
                .collect(),
        }
    }

    #[test]
    fn summaries() {
        let d = draws();
        assert_eq!(d.n_samples(), 5);
        assert_abs_diff_eq!(d.posterior_mean()[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d.posterior_mean()[1], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d.posterior_variance()[0], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(d.posterior_variance()[1], 10.0, epsilon = 1e-12);
    }

    #[test]
    fn quantiles_interpolate() {
        let d = draws();
        assert_abs_diff_eq!(d.quantile(0.5).unwrap()[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d.quantile(0.1).unwrap()[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(d.quantile(1.0).unwrap()[1], 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d.quantile(0.0).unwrap()[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn quantile_levels_outside_unit_interval_fail() {
        let d = draws();
        assert!(d.quantile(-3.0).is_err());
        assert!(d.quantile(1.5).is_err());
        assert!(d.quantile(f64::NAN).is_err());
    }

    #[test]
    fn columns_by_name() {
        let d = draws();
        assert_eq!(d.column("b.1").unwrap()[4], 2.0);
        assert!(d.column("c").is_none());
    }

    #[test]
    fn empty_draws() {
        let d = ApproxDraws {
            names: vec!["x".into()],
            samples: vec![],
        };
        assert_eq!(d.posterior_mean().len(), 0);
        assert_eq!(d.quantile(0.5).unwrap().len(), 0);
    }
}
