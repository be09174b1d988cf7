//! Constrained IRWLS weight fitting for one location.
//!
//! Given observed counts `b`, total count `N`, and a profile matrix `P`
//! (genes × cell types), we fit weights `w` for the design `A = N·P`:
//!
//! 1. start from the non-negative least-squares solution (rescaled onto the
//!    simplex in sum-to-one mode),
//! 2. repeat: predict `λ = A·w`, look up `Var(Y | λ_g)` per gene, and re-solve the
//!    variance-weighted least-squares problem as a QP under the constraints,
//! 3. stop when the L1 change in `w` drops below the tolerance, or return the
//!    last iterate at the iteration cap.
//!
//! A QP failure never escapes: the location gets fallback weights (uniform in
//! sum-to-one mode, all-zero otherwise) and a `FitStatus::Fallback` marker.

use nalgebra::{DMatrix, DVector};

use crate::domain::{Constraint, DeconvConfig, FitStatus, LocationOutcome, SolveMode, WeightFit};
use crate::error::{LocationFailure, SolverFault};
use crate::math::{QpSolution, solve_nonneg_qp, solve_nonneg_qp_capped};
use crate::models::{QuadratureModel, design_matrix, predict};

/// Solver knobs taken from the run configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSettings {
    pub mode: SolveMode,
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Active-set iterations per QP; `None` keeps the QP's own cap (10·n + 50).
    pub qp_max_iterations: Option<usize>,
}

impl SolverSettings {
    pub fn from_config(config: &DeconvConfig) -> Self {
        Self {
            mode: config.mode,
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            qp_max_iterations: None,
        }
    }

    /// Same reweighting scheme, different constraint.
    pub fn with_constraint(self, constraint: Constraint) -> Self {
        let mode = match self.mode {
            SolveMode::Irwls(_) => SolveMode::Irwls(constraint),
            SolveMode::Ols(_) => SolveMode::Ols(constraint),
        };
        Self { mode, ..self }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WeightSolver<'a> {
    quadrature: &'a QuadratureModel,
    settings: SolverSettings,
}

impl<'a> WeightSolver<'a> {
    pub fn new(quadrature: &'a QuadratureModel, settings: SolverSettings) -> Self {
        Self {
            quadrature,
            settings,
        }
    }

    pub fn settings(&self) -> SolverSettings {
        self.settings
    }

    /// Fit weights over the columns of `profile` for one location.
    pub fn solve(
        &self,
        profile: &DMatrix<f64>,
        counts: &DVector<f64>,
        total: f64,
    ) -> LocationOutcome<WeightFit> {
        if !(total > 0.0) {
            return Err(LocationFailure::EmptyLocation { total });
        }
        let n_types = profile.ncols();
        let constraint = self.settings.mode.constraint();
        let design = design_matrix(profile, total);
        let unit = DVector::from_element(counts.len(), 1.0);

        let outcome = match self.settings.mode {
            SolveMode::Ols(_) => self.weighted_qp(&design, counts, &unit, constraint).map(|sol| {
                WeightFit {
                    status: qp_status(&sol),
                    weights: sol.x,
                    iterations: 1,
                }
            }),
            SolveMode::Irwls(_) => self.irwls(&design, counts, &unit, constraint),
        };

        match outcome {
            Ok(fit) if fit.weights.iter().all(|v| v.is_finite()) => Ok(fit),
            Ok(_) => Ok(fallback(n_types, constraint, SolverFault::NonFinite)),
            Err(fault) => Ok(fallback(n_types, constraint, fault)),
        }
    }

    fn irwls(
        &self,
        design: &DMatrix<f64>,
        counts: &DVector<f64>,
        unit: &DVector<f64>,
        constraint: Constraint,
    ) -> Result<WeightFit, SolverFault> {
        let mut weights = self.weighted_qp(design, counts, unit, Constraint::NonNegative)?.x;
        if constraint == Constraint::SumToOne {
            let sum = weights.sum();
            weights = if sum > 0.0 {
                weights / sum
            } else {
                DVector::from_element(weights.len(), 1.0 / weights.len() as f64)
            };
        }

        let mut change = f64::INFINITY;
        for iteration in 1..=self.settings.max_iterations {
            let lambda = predict(design, &weights);
            let precision = lambda.map(|l| 1.0 / self.quadrature.variance(l));
            let next = self.weighted_qp(design, counts, &precision, constraint)?;
            change = (&next.x - &weights).lp_norm(1);
            weights = next.x.clone();
            if change < self.settings.tolerance {
                return Ok(WeightFit {
                    weights,
                    iterations: iteration,
                    status: qp_status(&next),
                });
            }
        }

        log::debug!(
            "IRWLS reached the iteration cap ({}) with last change {change:.3e}",
            self.settings.max_iterations
        );
        Ok(WeightFit {
            weights,
            iterations: self.settings.max_iterations,
            status: FitStatus::IterationCap,
        })
    }

    /// Solve `min Σ_g p_g (b_g − (A w)_g)²` under the constraint set.
    fn weighted_qp(
        &self,
        design: &DMatrix<f64>,
        counts: &DVector<f64>,
        precision: &DVector<f64>,
        constraint: Constraint,
    ) -> Result<QpSolution, SolverFault> {
        let mut scaled = design.clone();
        for (g, mut row) in scaled.row_iter_mut().enumerate() {
            row *= precision[g];
        }
        let h = design.transpose() * &scaled;
        let d = scaled.transpose() * counts;
        match self.settings.qp_max_iterations {
            Some(cap) => solve_nonneg_qp_capped(&h, &d, constraint, cap),
            None => solve_nonneg_qp(&h, &d, constraint),
        }
    }
}

/// A QP stopped at its active-set cap leaves the fit unconverged.
fn qp_status(sol: &QpSolution) -> FitStatus {
    if sol.converged {
        FitStatus::Converged
    } else {
        FitStatus::IterationCap
    }
}

fn fallback(n_types: usize, constraint: Constraint, fault: SolverFault) -> WeightFit {
    log::warn!("weight solve failed ({fault}); substituting fallback weights");
    let weights = match constraint {
        Constraint::SumToOne if n_types > 0 => {
            DVector::from_element(n_types, 1.0 / n_types as f64)
        }
        _ => DVector::zeros(n_types),
    };
    WeightFit {
        weights,
        iterations: 0,
        status: FitStatus::Fallback(fault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QuadratureSettings;
    use approx::assert_abs_diff_eq;

    fn quadrature() -> QuadratureModel {
        let settings = QuadratureSettings {
            grid_points: 200,
            count_cap: 200,
            hermite_nodes: 21,
            ..QuadratureSettings::default()
        };
        QuadratureModel::build(0.3, &settings).unwrap()
    }

    fn settings(mode: SolveMode) -> SolverSettings {
        SolverSettings {
            mode,
            tolerance: 1e-8,
            max_iterations: 100,
            qp_max_iterations: None,
        }
    }

    fn three_type_profile() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            5,
            3,
            &[
                0.50, 0.05, 0.10, //
                0.05, 0.40, 0.10, //
                0.20, 0.05, 0.40, //
                0.15, 0.30, 0.10, //
                0.10, 0.20, 0.30, //
            ],
        )
    }

    #[test]
    fn constrained_fit_on_small_location_is_a_distribution() {
        let q = quadrature();
        let solver = WeightSolver::new(&q, settings(SolveMode::Irwls(Constraint::SumToOne)));
        let counts = DVector::from_row_slice(&[10.0, 0.0, 5.0, 2.0, 1.0]);

        let fit = solver.solve(&three_type_profile(), &counts, 18.0).unwrap();
        assert_eq!(fit.weights.len(), 3);
        assert!(fit.weights.iter().all(|w| *w >= 0.0));
        assert_abs_diff_eq!(fit.weights.sum(), 1.0, epsilon = 1e-7);
        assert!(!matches!(fit.status, FitStatus::Fallback(_)));

        let again = solver.solve(&three_type_profile(), &counts, 18.0).unwrap();
        assert_eq!(fit, again);
    }

    #[test]
    fn noise_free_mixture_is_recovered() {
        let q = quadrature();
        let solver = WeightSolver::new(&q, settings(SolveMode::Irwls(Constraint::SumToOne)));
        let profile = three_type_profile();
        let truth = DVector::from_row_slice(&[0.6, 0.3, 0.1]);
        let counts = &profile * &truth * 500.0;

        let fit = solver.solve(&profile, &counts, 500.0).unwrap();
        for t in 0..3 {
            assert_abs_diff_eq!(fit.weights[t], truth[t], epsilon = 1e-4);
        }
    }

    #[test]
    fn constant_variance_reduces_to_single_ols_pass() {
        let grid = vec![0.01, 1.0, 100.0, 1e4];
        let flat = QuadratureModel::from_parts(0.3, grid, vec![4.0; 4], DMatrix::zeros(4, 1)).unwrap();
        let profile = three_type_profile();
        let counts = DVector::from_row_slice(&[30.0, 4.0, 11.0, 9.0, 6.0]);

        for constraint in [Constraint::SumToOne, Constraint::NonNegative] {
            let irwls = WeightSolver::new(&flat, settings(SolveMode::Irwls(constraint)))
                .solve(&profile, &counts, 60.0)
                .unwrap();
            let ols = WeightSolver::new(&flat, settings(SolveMode::Ols(constraint)))
                .solve(&profile, &counts, 60.0)
                .unwrap();
            assert_eq!(irwls.status, FitStatus::Converged);
            for t in 0..3 {
                assert_abs_diff_eq!(irwls.weights[t], ols.weights[t], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn non_negative_mode_tracks_total_scale() {
        let q = quadrature();
        let solver = WeightSolver::new(&q, settings(SolveMode::Irwls(Constraint::NonNegative)));
        let profile = three_type_profile();
        // Twice the counts the stated total implies.
        let counts = profile.column(0) * 200.0;
        let fit = solver.solve(&profile, &counts, 100.0).unwrap();
        assert_abs_diff_eq!(fit.weights[0], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(fit.weights[1], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn empty_location_is_rejected_without_solving() {
        let q = quadrature();
        let solver = WeightSolver::new(&q, settings(SolveMode::Irwls(Constraint::SumToOne)));
        let counts = DVector::zeros(5);
        assert_eq!(
            solver.solve(&three_type_profile(), &counts, 0.0).unwrap_err(),
            LocationFailure::EmptyLocation { total: 0.0 }
        );
    }

    #[test]
    fn qp_failure_substitutes_uniform_weights() {
        let q = quadrature();
        let solver = WeightSolver::new(&q, settings(SolveMode::Ols(Constraint::SumToOne)));
        let mut profile = three_type_profile();
        profile[(0, 0)] = f64::NAN;
        let counts = DVector::from_row_slice(&[1.0, 1.0, 1.0, 1.0, 1.0]);
        let fit = solver.solve(&profile, &counts, 5.0).unwrap();
        assert_eq!(fit.status, FitStatus::Fallback(SolverFault::NonFinite));
        for t in 0..3 {
            assert_abs_diff_eq!(fit.weights[t], 1.0 / 3.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn iteration_cap_returns_last_iterate() {
        let q = quadrature();
        let capped = SolverSettings {
            mode: SolveMode::Irwls(Constraint::SumToOne),
            tolerance: 0.0,
            max_iterations: 2,
            qp_max_iterations: None,
        };
        let counts = DVector::from_row_slice(&[10.0, 0.0, 5.0, 2.0, 1.0]);
        let fit = WeightSolver::new(&q, capped)
            .solve(&three_type_profile(), &counts, 18.0)
            .unwrap();
        assert_eq!(fit.iterations, 2);
        assert_eq!(fit.status, FitStatus::IterationCap);
        assert_abs_diff_eq!(fit.weights.sum(), 1.0, epsilon = 1e-7);
    }

    #[test]
    fn qp_stopped_at_its_cap_is_not_reported_converged() {
        let q = quadrature();
        let profile = three_type_profile();
        let truth = DVector::from_row_slice(&[0.6, 0.3, 0.1]);
        let counts = &profile * &truth * 100.0;

        for mode in [
            SolveMode::Ols(Constraint::NonNegative),
            SolveMode::Irwls(Constraint::NonNegative),
        ] {
            let capped = SolverSettings {
                qp_max_iterations: Some(1),
                ..settings(mode)
            };
            let fit = WeightSolver::new(&q, capped)
                .solve(&profile, &counts, 100.0)
                .unwrap();
            assert_eq!(fit.status, FitStatus::IterationCap, "{mode:?}");

            let full = WeightSolver::new(&q, settings(mode))
                .solve(&profile, &counts, 100.0)
                .unwrap();
            assert_eq!(full.status, FitStatus::Converged, "{mode:?}");
        }
    }
}
