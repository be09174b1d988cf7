//! Dense active-set quadratic programming for mixture weights.
//!
//! Solves
//!
//! ```text
//! minimize   ½ xᵀ H x − dᵀ x
//! subject to x ≥ 0
//!            1ᵀ x = 1        (Constraint::SumToOne only)
//! ```
//!
//! with a primal active-set loop:
//!
//! - solve the equality-constrained subproblem on the free set (KKT system),
//! - take the longest feasible step along that direction, pinning the first
//!   variable that hits zero,
//! - at a subspace minimiser, release the pinned variable with the most negative
//!   multiplier `λ_j = g_j − ν`, or stop when none is negative.
//!
//! `H` is normalised by its Frobenius norm and receives a small ridge so the free
//! subsystem is always positive definite. Index order is the only tie-break, so
//! identical inputs produce bit-identical outputs.

use nalgebra::{DMatrix, DVector};

use crate::domain::Constraint;
use crate::error::SolverFault;
use crate::math::ols::solve_square;

const RIDGE: f64 = 1e-7;
const STEP_TOL: f64 = 1e-12;
const MULTIPLIER_TOL: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub iterations: usize,
    /// False when the active-set loop hit its iteration cap. `x` is still feasible.
    pub converged: bool,
}

/// Active-set iterations allowed for an `n`-variable problem.
fn default_qp_cap(n: usize) -> usize {
    10 * n + 50
}

/// Solve the non-negative (optionally simplex-constrained) QP.
pub fn solve_nonneg_qp(
    h: &DMatrix<f64>,
    d: &DVector<f64>,
    constraint: Constraint,
) -> Result<QpSolution, SolverFault> {
    solve_nonneg_qp_capped(h, d, constraint, default_qp_cap(d.len()))
}

/// As `solve_nonneg_qp`, stopping after `max_iter` active-set iterations.
pub fn solve_nonneg_qp_capped(
    h: &DMatrix<f64>,
    d: &DVector<f64>,
    constraint: Constraint,
    max_iter: usize,
) -> Result<QpSolution, SolverFault> {
    let n = d.len();
    if h.nrows() != n || h.ncols() != n {
        return Err(SolverFault::SingularSystem);
    }
    if n == 0 {
        return match constraint {
            Constraint::SumToOne => Err(SolverFault::InfeasibleConstraint),
            Constraint::NonNegative => Ok(QpSolution {
                x: DVector::zeros(0),
                iterations: 0,
                converged: true,
            }),
        };
    }
    if h.iter().chain(d.iter()).any(|v| !v.is_finite()) {
        return Err(SolverFault::NonFinite);
    }

    let norm = h.norm();
    let scale = if norm > 0.0 { norm } else { 1.0 };
    let hs = h / scale + DMatrix::<f64>::identity(n, n) * RIDGE;
    let ds = d / scale;

    let simplex = constraint == Constraint::SumToOne;
    // Feasible start: the simplex barycentre, or the origin with every bound active.
    let mut x = if simplex {
        DVector::from_element(n, 1.0 / n as f64)
    } else {
        DVector::zeros(n)
    };
    let mut active = vec![!simplex; n];
    let mut pending_nu: Option<f64> = None;

    for iter in 1..=max_iter {
        let g = &hs * &x - &ds;

        let nu = match pending_nu.take() {
            Some(nu) => nu,
            None => {
                let free: Vec<usize> = (0..n).filter(|&i| !active[i]).collect();
                if free.is_empty() {
                    0.0
                } else {
                    let (p, nu) = kkt_direction(&hs, &g, &free, simplex)?;
                    if p.amax() > STEP_TOL * (1.0 + x.amax()) {
                        let mut alpha = 1.0_f64;
                        let mut blocking = None;
                        for (k, &i) in free.iter().enumerate() {
                            if p[k] < 0.0 {
                                let ratio = -x[i] / p[k];
                                if ratio < alpha {
                                    alpha = ratio;
                                    blocking = Some(i);
                                }
                            }
                        }
                        for (k, &i) in free.iter().enumerate() {
                            x[i] = (x[i] + alpha * p[k]).max(0.0);
                        }
                        match blocking {
                            Some(i) => {
                                x[i] = 0.0;
                                active[i] = true;
                            }
                            // Full step lands on the subspace minimiser.
                            None => pending_nu = Some(nu),
                        }
                        continue;
                    }
                    nu
                }
            }
        };

        let mut release = None;
        let mut worst = -MULTIPLIER_TOL;
        for i in 0..n {
            if active[i] {
                let lambda = g[i] - nu;
                if lambda < worst {
                    worst = lambda;
                    release = Some(i);
                }
            }
        }
        match release {
            Some(i) => active[i] = false,
            None => return Ok(finish(x, iter, true, simplex)),
        }
    }

    log::debug!("active-set QP reached its iteration cap ({max_iter}) with n={n}");
    Ok(finish(x, max_iter, false, simplex))
}

/// Solve the KKT system for the step `p` on the free set.
///
/// Returns `(p, ν)` where `ν` is the sum-to-one multiplier (zero without it).
fn kkt_direction(
    h: &DMatrix<f64>,
    g: &DVector<f64>,
    free: &[usize],
    simplex: bool,
) -> Result<(DVector<f64>, f64), SolverFault> {
    let m = free.len();
    let dim = if simplex { m + 1 } else { m };
    let mut kkt = DMatrix::<f64>::zeros(dim, dim);
    let mut rhs = DVector::<f64>::zeros(dim);

    for (a, &i) in free.iter().enumerate() {
        rhs[a] = -g[i];
        for (b, &j) in free.iter().enumerate() {
            kkt[(a, b)] = h[(i, j)];
        }
        if simplex {
            kkt[(a, m)] = 1.0;
            kkt[(m, a)] = 1.0;
        }
    }

    let z = solve_square(&kkt, &rhs).ok_or(SolverFault::SingularSystem)?;
    let p = z.rows(0, m).into_owned();
    let nu = if simplex { -z[m] } else { 0.0 };
    Ok((p, nu))
}

fn finish(mut x: DVector<f64>, iterations: usize, converged: bool, simplex: bool) -> QpSolution {
    x.iter_mut().for_each(|v| *v = v.max(0.0));
    if simplex {
        let total = x.sum();
        if total > 0.0 {
            x /= total;
        }
    }
    QpSolution {
        x,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn interior_optimum_is_the_unconstrained_solution() {
        let h = DMatrix::identity(2, 2);
        let d = DVector::from_row_slice(&[0.2, 0.3]);
        let sol = solve_nonneg_qp(&h, &d, Constraint::NonNegative).unwrap();
        assert!(sol.converged);
        assert_abs_diff_eq!(sol.x[0], 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.x[1], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn negative_coordinate_is_pinned_to_zero() {
        let h = DMatrix::identity(2, 2);
        let d = DVector::from_row_slice(&[1.0, -1.0]);
        let sol = solve_nonneg_qp(&h, &d, Constraint::NonNegative).unwrap();
        assert_abs_diff_eq!(sol.x[0], 1.0, epsilon = 1e-6);
        assert_eq!(sol.x[1], 0.0);
    }

    #[test]
    fn simplex_constraint_projects_onto_a_vertex() {
        let h = DMatrix::identity(3, 3);
        let d = DVector::from_row_slice(&[2.0, 0.0, 0.0]);
        let sol = solve_nonneg_qp(&h, &d, Constraint::SumToOne).unwrap();
        assert_abs_diff_eq!(sol.x[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sol.x[1], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sol.x[2], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(sol.x.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn simplex_with_flat_objective_stays_at_barycentre() {
        let h = DMatrix::identity(3, 3);
        let d = DVector::zeros(3);
        let sol = solve_nonneg_qp(&h, &d, Constraint::SumToOne).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(sol.x[i], 1.0 / 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn collinear_columns_still_solve() {
        // Two identical columns: H is rank one before the ridge.
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let b = DVector::from_row_slice(&[1.0, 2.0, 3.0]);
        let h = a.transpose() * &a;
        let d = a.transpose() * &b;
        let sol = solve_nonneg_qp(&h, &d, Constraint::SumToOne).unwrap();
        assert_abs_diff_eq!(sol.x.sum(), 1.0, epsilon = 1e-9);
        assert!(sol.x.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn empty_simplex_is_infeasible() {
        let h = DMatrix::<f64>::zeros(0, 0);
        let d = DVector::<f64>::zeros(0);
        assert_eq!(
            solve_nonneg_qp(&h, &d, Constraint::SumToOne).unwrap_err(),
            SolverFault::InfeasibleConstraint
        );
    }

    #[test]
    fn non_finite_input_is_reported() {
        let h = DMatrix::identity(2, 2);
        let d = DVector::from_row_slice(&[f64::NAN, 1.0]);
        assert_eq!(
            solve_nonneg_qp(&h, &d, Constraint::NonNegative).unwrap_err(),
            SolverFault::NonFinite
        );
    }

    #[test]
    fn capped_solve_reports_non_convergence_with_a_feasible_point() {
        let h = DMatrix::from_row_slice(3, 3, &[2.0, 0.3, 0.1, 0.3, 1.5, 0.2, 0.1, 0.2, 1.0]);
        let d = DVector::from_row_slice(&[1.0, 0.8, 0.5]);
        let capped = solve_nonneg_qp_capped(&h, &d, Constraint::NonNegative, 1).unwrap();
        assert!(!capped.converged);
        assert_eq!(capped.iterations, 1);
        assert!(capped.x.iter().all(|v| *v >= 0.0));

        let full = solve_nonneg_qp(&h, &d, Constraint::NonNegative).unwrap();
        assert!(full.converged);
    }
}
