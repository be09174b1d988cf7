//! Mixture design and prediction.
//!
//! The solver relies on two primitive operations:
//! - build the design matrix `A = N·P` for a location with total count `N`
//! - predict expected counts `λ = A·w` for a weight vector `w`

use nalgebra::{DMatrix, DVector};

/// Design matrix: each column is one cell type's profile scaled by `total`.
pub fn design_matrix(profile: &DMatrix<f64>, total: f64) -> DMatrix<f64> {
    profile * total
}

/// Expected counts under weights `w`.
pub fn predict(design: &DMatrix<f64>, weights: &DVector<f64>) -> DVector<f64> {
    design * weights
}

/// Expected counts when the location is entirely cell type `t`.
pub fn single_type_prediction(profile: &DMatrix<f64>, total: f64, t: usize) -> DVector<f64> {
    profile.column(t) * total
}

/// Restrict a profile to the given cell-type columns, in the given order.
pub fn select_types(profile: &DMatrix<f64>, types: &[usize]) -> DMatrix<f64> {
    profile.select_columns(types)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_scales_with_total() {
        let profile = DMatrix::from_row_slice(2, 2, &[0.25, 0.5, 0.75, 0.5]);
        let design = design_matrix(&profile, 100.0);
        let lambda = predict(&design, &DVector::from_row_slice(&[0.5, 0.5]));
        assert!((lambda[0] - 37.5).abs() < 1e-12);
        assert!((lambda[1] - 62.5).abs() < 1e-12);

        let single = single_type_prediction(&profile, 100.0, 1);
        assert_eq!(single, DVector::from_row_slice(&[50.0, 50.0]));
    }

    #[test]
    fn select_types_preserves_requested_order() {
        let profile = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        let sub = select_types(&profile, &[2, 0]);
        assert_eq!(sub, DMatrix::from_row_slice(1, 2, &[3.0, 1.0]));
    }
}
