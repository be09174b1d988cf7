//! Bulk platform-effect fit.
//!
//! All locations are summed into one pseudo-bulk observation and fitted once
//! with non-negative IRWLS. The per-gene ratio between observed and predicted
//! bulk counts estimates how the spatial platform distorts each gene relative
//! to the reference; `adjusted_profile` folds that back into the reference.

use nalgebra::{DMatrix, DVector};

use crate::domain::{Constraint, FitStatus, SpatialDataset, WeightFit};
use crate::error::DeconvError;
use crate::fit::context::DeconvContext;
use crate::fit::solver::{SolverSettings, WeightSolver};
use crate::models::{design_matrix, predict};

/// Per-gene log ratios are clipped to `±LOG_RATIO_CLIP` before adjusting the profile.
const LOG_RATIO_CLIP: f64 = 3.0;
/// Pseudo-count added to both sides of the observed/predicted ratio.
const PSEUDO_COUNT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct BulkFit {
    /// Weights rescaled to sum to one.
    pub proportions: DVector<f64>,
    pub fit: WeightFit,
    /// `ln((observed + ½) / (predicted + ½))` per gene-set gene.
    pub gene_log_ratio: DVector<f64>,
    /// Summed total count of the non-empty locations.
    pub total: f64,
}

impl BulkFit {
    /// Scale each gene row by its clipped ratio, then restore the original column sums.
    pub fn adjusted_profile(&self, profile: &DMatrix<f64>) -> DMatrix<f64> {
        let mut adjusted = profile.clone();
        for (g, mut row) in adjusted.row_iter_mut().enumerate() {
            let ratio = self.gene_log_ratio[g]
                .clamp(-LOG_RATIO_CLIP, LOG_RATIO_CLIP)
                .exp();
            row *= ratio;
        }
        for (t, mut column) in adjusted.column_iter_mut().enumerate() {
            let before = profile.column(t).sum();
            let after = column.sum();
            if after > 0.0 {
                column *= before / after;
            }
        }
        adjusted
    }
}

pub fn fit_bulk(ctx: &DeconvContext, data: &SpatialDataset) -> Result<BulkFit, DeconvError> {
    let bound = ctx.bind(data)?;
    let (counts, total) = bound.aggregate();
    if !(total > 0.0) {
        return Err(DeconvError::InvalidData(
            "no location has a positive total count".to_string(),
        ));
    }

    let settings =
        SolverSettings::from_config(ctx.config()).with_constraint(Constraint::NonNegative);
    let solver = WeightSolver::new(ctx.quadrature(), settings);
    let profile = ctx.profile();
    let fit = solver
        .solve(profile, &counts, total)
        .map_err(|e| DeconvError::InvalidData(format!("bulk fit failed: {e}")))?;
    if let FitStatus::Fallback(fault) = fit.status {
        return Err(DeconvError::InvalidData(format!("bulk fit failed: {fault}")));
    }
    let sum = fit.weights.sum();
    if !(sum > 0.0) {
        return Err(DeconvError::InvalidData(
            "bulk fit assigned zero weight to every cell type".to_string(),
        ));
    }

    let predicted = predict(&design_matrix(profile, total), &fit.weights);
    let gene_log_ratio = counts.zip_map(&predicted, |obs, pred| {
        ((obs + PSEUDO_COUNT) / (pred.max(0.0) + PSEUDO_COUNT)).ln()
    });
    log::info!(
        "bulk fit over total {total:.0}: {} iterations, weight sum {sum:.3}",
        fit.iterations
    );

    Ok(BulkFit {
        proportions: &fit.weights / sum,
        fit,
        gene_log_ratio,
        total,
    })
}
