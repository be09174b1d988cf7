//! Gauss-Hermite quadrature rules.
//!
//! Expectations over the per-gene log-normal noise term are computed as
//!
//! ```text
//! E[f(ε)], ε ~ N(0, σ²)  ≈  Σ_k w_k f(σ z_k)
//! ```
//!
//! where `z_k = √2 x_k`, `x_k` are the roots of the physicists' Hermite
//! polynomial `H_n`, and `w_k` are the Hermite weights divided by `√π` (so they
//! sum to one). Nodes and weights come from the Golub-Welsch construction: the
//! eigenvalues of the symmetric tridiagonal Jacobi matrix are the nodes, and the
//! squared first components of its unit eigenvectors are the normalised weights.

use nalgebra::DMatrix;

use crate::error::DeconvError;

/// A normalised Gauss-Hermite rule for integrating against a standard normal.
#[derive(Debug, Clone)]
pub struct GaussHermite {
    /// Standard-normal abscissas `z_k = √2 x_k`, ascending.
    pub points: Vec<f64>,
    /// Weights summing to one.
    pub weights: Vec<f64>,
}

impl GaussHermite {
    /// Build an `n`-point rule.
    pub fn new(n: usize) -> Result<Self, DeconvError> {
        if n == 0 {
            return Err(DeconvError::InvalidConfig(
                "Gauss-Hermite rule needs at least one node.".to_string(),
            ));
        }

        let mut jacobi = DMatrix::<f64>::zeros(n, n);
        for i in 1..n {
            let b = (i as f64 / 2.0).sqrt();
            jacobi[(i - 1, i)] = b;
            jacobi[(i, i - 1)] = b;
        }

        let eig = jacobi.symmetric_eigen();
        let mut pairs: Vec<(f64, f64)> = (0..n)
            .map(|k| {
                let v0 = eig.eigenvectors[(0, k)];
                (eig.eigenvalues[k], v0 * v0)
            })
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let total: f64 = pairs.iter().map(|p| p.1).sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(DeconvError::InvalidQuadrature(
                "Gauss-Hermite weights did not normalise.".to_string(),
            ));
        }

        Ok(Self {
            points: pairs
                .iter()
                .map(|p| std::f64::consts::SQRT_2 * p.0)
                .collect(),
            weights: pairs.iter().map(|p| p.1 / total).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// `E[f(Z)]` for `Z ~ N(0, 1)`.
    pub fn expect<F: Fn(f64) -> f64>(&self, f: F) -> f64 {
        self.points
            .iter()
            .zip(self.weights.iter())
            .map(|(&z, &w)| w * f(z))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Roots of H_7 and the matching weights (unnormalised, sum = √π).
    const NODES_7: [f64; 7] = [
        -2.651961356835233,
        -1.673551628767471,
        -0.816287882858965,
        0.0,
        0.816287882858965,
        1.673551628767471,
        2.651961356835233,
    ];
    const WEIGHTS_7: [f64; 7] = [
        0.0009717812450995,
        0.0545155828191270,
        0.4256072526101277,
        0.8102646175568073,
        0.4256072526101277,
        0.0545155828191270,
        0.0009717812450995,
    ];

    #[test]
    fn seven_point_rule_matches_tabulated_values() {
        let rule = GaussHermite::new(7).unwrap();
        let sqrt_pi = std::f64::consts::PI.sqrt();
        for k in 0..7 {
            assert_relative_eq!(
                rule.points[k] / std::f64::consts::SQRT_2,
                NODES_7[k],
                epsilon = 1e-10
            );
            assert_relative_eq!(rule.weights[k] * sqrt_pi, WEIGHTS_7[k], epsilon = 1e-10);
        }
    }

    #[test]
    fn rule_reproduces_normal_moments() {
        let rule = GaussHermite::new(21).unwrap();
        assert_relative_eq!(rule.expect(|_| 1.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(rule.expect(|z| z), 0.0, epsilon = 1e-12);
        assert_relative_eq!(rule.expect(|z| z * z), 1.0, epsilon = 1e-10);
        assert_relative_eq!(rule.expect(|z| z.powi(4)), 3.0, epsilon = 1e-9);
        // E[e^{σZ}] = e^{σ²/2}
        assert_relative_eq!(rule.expect(|z| (0.5 * z).exp()), (0.125f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn zero_nodes_is_rejected() {
        assert!(GaussHermite::new(0).is_err());
    }
}
