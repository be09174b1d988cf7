//! Precomputed count-noise model.
//!
//! Counts are modelled as `Y | λ ~ Poisson(λ·e^ε)` with `ε ~ N(0, σ²)`, where
//! `λ` is the expected count of a gene at a location (mixture prediction scaled
//! by the location's total count). Evaluating the integral over `ε` per gene per
//! iteration would dominate the solve, so we tabulate once per run:
//!
//! - a log-spaced grid of `λ` values,
//! - `Var(Y)` at each grid point (used to reweight residuals),
//! - `log P(Y = y | λ)` for `y = 0..=count_cap` (used to score fits).
//!
//! Lookups interpolate linearly in `log λ`. Counts above `count_cap` and `λ`
//! above the grid are evaluated directly from the quadrature rule, so deep
//! locations are scored against their actual expected counts. `λ` below the
//! grid is clamped to the first grid point. Tables supplied through
//! `from_parts` carry no rule and clamp at both ends instead.
//!
//! The model is immutable after construction and is shared by reference across
//! all worker threads.

use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::ln_gamma;

use crate::domain::QuadratureSettings;
use crate::error::DeconvError;
use crate::math::{GaussHermite, log_space};

#[derive(Debug, Clone)]
pub struct QuadratureModel {
    sigma: f64,
    ln_grid: Vec<f64>,
    ln_variance: Vec<f64>,
    /// Rows are grid points, columns are observed counts `0..=count_cap`.
    log_lik: DMatrix<f64>,
    /// Present for built models; used off the table.
    rule: Option<GaussHermite>,
}

impl QuadratureModel {
    /// Tabulate the model for dispersion `sigma`.
    pub fn build(sigma: f64, settings: &QuadratureSettings) -> Result<Self, DeconvError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(DeconvError::InvalidConfig(format!(
                "sigma must be finite and > 0 (got {sigma})"
            )));
        }
        let rule = GaussHermite::new(settings.hermite_nodes)?;
        let grid = log_space(settings.lambda_min, settings.lambda_max, settings.grid_points)?;
        let cap = settings.count_cap;

        let mut ln_factorial = vec![0.0_f64; cap + 1];
        for y in 1..=cap {
            ln_factorial[y] = ln_factorial[y - 1] + (y as f64).ln();
        }
        let ln_weights: Vec<f64> = rule.weights.iter().map(|w| w.ln()).collect();

        let mut ln_variance = Vec::with_capacity(grid.len());
        let mut log_lik = DMatrix::<f64>::zeros(grid.len(), cap + 1);
        let mut terms = vec![0.0_f64; rule.len()];

        for (k, &lambda) in grid.iter().enumerate() {
            let ln_rates: Vec<f64> = rule.points.iter().map(|z| lambda.ln() + sigma * z).collect();
            let rates: Vec<f64> = ln_rates.iter().map(|v| v.exp()).collect();
            ln_variance.push(mixture_variance(&rule, &rates).ln());

            for y in 0..=cap {
                let yf = y as f64;
                for i in 0..rule.len() {
                    terms[i] = ln_weights[i] + yf * ln_rates[i] - rates[i] - ln_factorial[y];
                }
                log_lik[(k, y)] = log_sum_exp(&terms);
            }
        }

        let mut model = Self::assemble(sigma, grid, ln_variance, log_lik)?;
        model.rule = Some(rule);
        Ok(model)
    }

    /// Wrap an externally computed table.
    ///
    /// `grid` must be strictly increasing and positive, `variance` positive, and
    /// `log_lik` must have one row per grid point and one column per count
    /// `0..=count_cap`.
    pub fn from_parts(
        sigma: f64,
        grid: Vec<f64>,
        variance: Vec<f64>,
        log_lik: DMatrix<f64>,
    ) -> Result<Self, DeconvError> {
        if variance.len() != grid.len() {
            return Err(DeconvError::InvalidQuadrature(format!(
                "{} variances for {} grid points",
                variance.len(),
                grid.len()
            )));
        }
        if variance.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return Err(DeconvError::InvalidQuadrature(
                "variances must be finite and positive".to_string(),
            ));
        }
        let ln_variance = variance.iter().map(|v| v.ln()).collect();
        Self::assemble(sigma, grid, ln_variance, log_lik)
    }

    fn assemble(
        sigma: f64,
        grid: Vec<f64>,
        ln_variance: Vec<f64>,
        log_lik: DMatrix<f64>,
    ) -> Result<Self, DeconvError> {
        if grid.len() < 2 {
            return Err(DeconvError::InvalidQuadrature(
                "grid needs at least two points".to_string(),
            ));
        }
        if grid.iter().any(|v| !(v.is_finite() && *v > 0.0))
            || grid.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(DeconvError::InvalidQuadrature(
                "grid must be positive, finite and strictly increasing".to_string(),
            ));
        }
        if log_lik.nrows() != grid.len() || log_lik.ncols() == 0 {
            return Err(DeconvError::InvalidQuadrature(format!(
                "likelihood table is {}x{} for {} grid points",
                log_lik.nrows(),
                log_lik.ncols(),
                grid.len()
            )));
        }
        if log_lik.iter().any(|v| !v.is_finite()) {
            return Err(DeconvError::InvalidQuadrature(
                "likelihood table has non-finite entries".to_string(),
            ));
        }
        Ok(Self {
            sigma,
            ln_grid: grid.iter().map(|v| v.ln()).collect(),
            ln_variance,
            log_lik,
            rule: None,
        })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn count_cap(&self) -> usize {
        self.log_lik.ncols() - 1
    }

    pub fn grid(&self) -> Vec<f64> {
        self.ln_grid.iter().map(|v| v.exp()).collect()
    }

    /// Effective variance of the observed count at expected count `lambda`.
    pub fn variance(&self, lambda: f64) -> f64 {
        if let Some(rule) = self.off_grid_rule(lambda) {
            return mixture_variance(rule, &self.node_rates(rule, lambda));
        }
        let (k, frac) = self.locate(lambda);
        lerp(self.ln_variance[k], self.ln_variance[k + 1], frac).exp()
    }

    /// `log P(Y = count | λ)` with `count` rounded to the nearest non-negative integer.
    pub fn log_likelihood(&self, count: f64, lambda: f64) -> f64 {
        let y = count.round().max(0.0);
        let cap = self.count_cap() as f64;
        let direct = match &self.rule {
            Some(rule) if y > cap => Some(rule),
            _ => self.off_grid_rule(lambda),
        };
        if let Some(rule) = direct {
            return self.direct_log_likelihood(rule, y, lambda);
        }
        let (k, frac) = self.locate(lambda);
        let y = y.min(cap) as usize;
        lerp(self.log_lik[(k, y)], self.log_lik[(k + 1, y)], frac)
    }

    /// Total log-likelihood of a count vector against predicted expected counts.
    pub fn score(&self, counts: &DVector<f64>, lambda: &DVector<f64>) -> f64 {
        counts
            .iter()
            .zip(lambda.iter())
            .map(|(&y, &l)| self.log_likelihood(y, l))
            .sum()
    }

    fn off_grid_rule(&self, lambda: f64) -> Option<&GaussHermite> {
        let last = self.ln_grid[self.ln_grid.len() - 1];
        match &self.rule {
            Some(rule) if lambda > 0.0 && lambda.ln() > last => Some(rule),
            _ => None,
        }
    }

    /// `λ·e^{σ z_k}` at every node, with `λ` floored at the first grid point.
    fn node_rates(&self, rule: &GaussHermite, lambda: f64) -> Vec<f64> {
        let ln_lambda = if lambda > 0.0 {
            lambda.ln().max(self.ln_grid[0])
        } else {
            self.ln_grid[0]
        };
        rule.points
            .iter()
            .map(|z| (ln_lambda + self.sigma * z).exp())
            .collect()
    }

    fn direct_log_likelihood(&self, rule: &GaussHermite, y: f64, lambda: f64) -> f64 {
        let ln_fact = ln_gamma(y + 1.0);
        let terms: Vec<f64> = self
            .node_rates(rule, lambda)
            .iter()
            .zip(&rule.weights)
            .map(|(rate, w)| w.ln() + y * rate.ln() - rate - ln_fact)
            .collect();
        log_sum_exp(&terms)
    }

    /// Lower grid index and interpolation fraction in log space, clamped to the grid.
    fn locate(&self, lambda: f64) -> (usize, f64) {
        let last = self.ln_grid.len() - 1;
        if !(lambda > 0.0) {
            return (0, 0.0);
        }
        let x = lambda.ln();
        if x <= self.ln_grid[0] {
            return (0, 0.0);
        }
        if x >= self.ln_grid[last] {
            return (last - 1, 1.0);
        }
        let upper = self.ln_grid.partition_point(|&g| g <= x);
        let k = upper - 1;
        let frac = (x - self.ln_grid[k]) / (self.ln_grid[k + 1] - self.ln_grid[k]);
        (k, frac)
    }
}

/// Var(Y) = E[rate] + Var(rate) for a Poisson mixture over the node rates.
fn mixture_variance(rule: &GaussHermite, rates: &[f64]) -> f64 {
    let mean: f64 = rule.weights.iter().zip(rates).map(|(w, r)| w * r).sum();
    let second: f64 = rule.weights.iter().zip(rates).map(|(w, r)| w * r * r).sum();
    mean + (second - mean * mean).max(0.0)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + t * (b - a)
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn small_settings() -> QuadratureSettings {
        QuadratureSettings {
            lambda_min: 0.01,
            lambda_max: 1e4,
            grid_points: 200,
            count_cap: 150,
            hermite_nodes: 31,
        }
    }

    #[test]
    fn variance_matches_closed_form_at_grid_points() {
        let sigma: f64 = 0.4;
        let model = QuadratureModel::build(sigma, &small_settings()).unwrap();
        let s2 = sigma * sigma;
        for &lambda in model.grid().iter().step_by(37) {
            let expected = lambda * (s2 / 2.0).exp() + lambda * lambda * s2.exp() * (s2.exp() - 1.0);
            assert_relative_eq!(model.variance(lambda), expected, max_relative = 1e-8);
        }
    }

    #[test]
    fn small_lambda_is_clamped_to_the_grid() {
        let model = QuadratureModel::build(0.3, &small_settings()).unwrap();
        assert_eq!(model.variance(1e-9), model.variance(0.01));
        assert_eq!(model.variance(0.0), model.variance(0.01));
        assert_eq!(model.log_likelihood(3.0, 1e-6), model.log_likelihood(3.0, 0.01));
    }

    #[test]
    fn large_lambda_is_evaluated_beyond_the_grid() {
        let sigma: f64 = 0.3;
        let model = QuadratureModel::build(sigma, &small_settings()).unwrap();
        let s2 = sigma * sigma;
        let lambda = 5e4;
        let expected = lambda * (s2 / 2.0).exp() + lambda * lambda * s2.exp() * (s2.exp() - 1.0);
        assert_relative_eq!(model.variance(lambda), expected, max_relative = 1e-8);
        assert!(model.variance(lambda) > model.variance(1e4));
        assert!(model.log_likelihood(3.0, 1e12) < model.log_likelihood(3.0, 1e4));
    }

    #[test]
    fn likelihood_rows_are_normalised_for_small_lambda() {
        let model = QuadratureModel::build(0.3, &small_settings()).unwrap();
        let lambda = model.grid()[90];
        assert!(lambda < 10.0);
        let total: f64 = (0..=model.count_cap())
            .map(|y| model.log_likelihood(y as f64, lambda).exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn likelihood_is_near_poisson_for_tiny_sigma() {
        let model = QuadratureModel::build(1e-4, &small_settings()).unwrap();
        let lambda = model.grid()[80];
        let y = 4.0_f64;
        let poisson = y * lambda.ln() - lambda - (1.0 * 2.0 * 3.0 * 4.0_f64).ln();
        assert_relative_eq!(model.log_likelihood(y, lambda), poisson, epsilon = 1e-4);
    }

    #[test]
    fn likelihood_peaks_near_the_observed_count() {
        let model = QuadratureModel::build(0.3, &small_settings()).unwrap();
        let at = model.log_likelihood(20.0, 20.0);
        assert!(at > model.log_likelihood(20.0, 5.0));
        assert!(at > model.log_likelihood(20.0, 80.0));
    }

    #[test]
    fn counts_above_cap_match_a_wider_table() {
        let narrow = QuadratureModel::build(0.3, &small_settings()).unwrap();
        let wide = QuadratureModel::build(
            0.3,
            &QuadratureSettings {
                count_cap: 600,
                ..small_settings()
            },
        )
        .unwrap();
        let lambda = narrow.grid()[160];
        assert!(lambda > 150.0 && lambda < 1e4);
        for y in [151.0, 300.0, 600.0] {
            assert_relative_eq!(
                narrow.log_likelihood(y, lambda),
                wide.log_likelihood(y, lambda),
                max_relative = 1e-9
            );
        }
    }

    #[test]
    fn deep_counts_prefer_the_matching_lambda() {
        let model = QuadratureModel::build(0.2, &small_settings()).unwrap();
        let y = 6000.0;
        let at = model.log_likelihood(y, y);
        assert!(at > model.log_likelihood(y, 222.0));
        assert!(at > model.log_likelihood(y, 1e4));
        assert!(at > model.log_likelihood(y, 3000.0));
    }

    #[test]
    fn external_tables_clamp_counts_and_lambda() {
        let grid = vec![0.1, 1.0, 10.0];
        let log_lik = DMatrix::from_row_slice(3, 2, &[-0.1, -2.0, -0.5, -0.9, -3.0, -1.5]);
        let model = QuadratureModel::from_parts(0.5, grid, vec![1.0; 3], log_lik).unwrap();
        assert_relative_eq!(model.log_likelihood(40.0, 10.0), -1.5, epsilon = 1e-12);
        assert_relative_eq!(model.log_likelihood(1.0, 1e6), -1.5, epsilon = 1e-12);
        assert_eq!(model.variance(1e6), model.variance(10.0));
    }

    #[test]
    fn from_parts_accepts_constant_variance() {
        let grid = vec![0.1, 1.0, 10.0, 100.0];
        let model =
            QuadratureModel::from_parts(0.5, grid, vec![2.0; 4], DMatrix::zeros(4, 1)).unwrap();
        assert_relative_eq!(model.variance(0.5), 2.0, epsilon = 1e-12);
        assert_relative_eq!(model.variance(5e3), 2.0, epsilon = 1e-12);
        assert_eq!(model.count_cap(), 0);
    }

    #[test]
    fn from_parts_rejects_unsorted_grid() {
        let err = QuadratureModel::from_parts(
            0.5,
            vec![1.0, 0.5, 2.0],
            vec![1.0; 3],
            DMatrix::zeros(3, 2),
        );
        assert!(matches!(err, Err(DeconvError::InvalidQuadrature(_))));
    }

    #[test]
    fn model_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QuadratureModel>();
    }
}
