//! Dispersion (σ) selection.
//!
//! Each candidate σ gets its own quadrature table; a sample of non-empty
//! locations is fitted with non-negative IRWLS under that table and the summed
//! log-likelihood decides. Candidates are evaluated in parallel but compared in
//! input order.

use crate::domain::{Constraint, FitStatus, SpatialDataset};
use crate::error::DeconvError;
use crate::fit::batch::fan_out;
use crate::fit::context::DeconvContext;
use crate::fit::solver::{SolverSettings, WeightSolver};
use crate::models::{QuadratureModel, design_matrix, predict};

/// 0.1, 0.2, ..., 1.5.
pub fn default_sigma_candidates() -> Vec<f64> {
    (1..=15).map(|i| i as f64 / 10.0).collect()
}

#[derive(Debug, Clone)]
pub struct SigmaChoice {
    pub sigma: f64,
    /// `(σ, total log-likelihood)` for every candidate, in input order.
    pub scores: Vec<(f64, f64)>,
    pub model: QuadratureModel,
}

pub fn choose_sigma(
    ctx: &DeconvContext,
    data: &SpatialDataset,
    candidates: &[f64],
    sample_size: usize,
) -> Result<SigmaChoice, DeconvError> {
    if candidates.is_empty() {
        return Err(DeconvError::InvalidConfig(
            "no sigma candidates given".to_string(),
        ));
    }
    let bound = ctx.bind(data)?;
    let sample: Vec<usize> = (0..bound.n_locations())
        .filter(|&loc| bound.observation(loc).1 > 0.0)
        .take(sample_size.max(1))
        .collect();
    if sample.is_empty() {
        return Err(DeconvError::InvalidData(
            "no non-empty locations to choose sigma from".to_string(),
        ));
    }
    let observations: Vec<_> = sample.iter().map(|&loc| bound.observation(loc)).collect();

    let config = ctx.config();
    let settings =
        SolverSettings::from_config(config).with_constraint(Constraint::NonNegative);
    let profile = ctx.profile();

    log::info!(
        "choosing sigma from {} candidates on {} locations",
        candidates.len(),
        observations.len()
    );
    let (evaluated, _) = fan_out(candidates.len(), config.max_workers, |i| {
        let model = QuadratureModel::build(candidates[i], &config.quadrature)?;
        let solver = WeightSolver::new(&model, settings);
        let mut score = 0.0;
        for (counts, total) in &observations {
            let Ok(fit) = solver.solve(profile, counts, *total) else {
                continue;
            };
            if matches!(fit.status, FitStatus::Fallback(_)) {
                continue;
            }
            let lambda = predict(&design_matrix(profile, *total), &fit.weights);
            score += model.score(counts, &lambda);
        }
        Ok::<_, DeconvError>((score, model))
    });

    let mut scores = Vec::with_capacity(candidates.len());
    let mut models = Vec::with_capacity(candidates.len());
    for (sigma, result) in candidates.iter().zip(evaluated) {
        let (score, model) = result?;
        log::debug!("sigma={sigma:.2}: log-likelihood {score:.3}");
        scores.push((*sigma, score));
        models.push(model);
    }

    let best = select_best(&scores).ok_or_else(|| {
        DeconvError::InvalidData("every sigma candidate produced a non-finite score".to_string())
    })?;
    let sigma = scores[best].0;
    log::info!("chose sigma={sigma:.2} (log-likelihood {:.3})", scores[best].1);
    Ok(SigmaChoice {
        sigma,
        scores,
        model: models.swap_remove(best),
    })
}

/// Index of the highest finite score; ties go to the smaller σ.
fn select_best(scores: &[(f64, f64)]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &(sigma, score)) in scores.iter().enumerate() {
        if !score.is_finite() {
            continue;
        }
        best = match best {
            Some(b) => {
                let (best_sigma, best_score) = scores[b];
                if score > best_score || (score == best_score && sigma < best_sigma) {
                    Some(i)
                } else {
                    Some(b)
                }
            }
            None => Some(i),
        };
    }
    best
}
