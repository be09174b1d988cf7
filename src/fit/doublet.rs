//! Singlet / doublet classification for one location.
//!
//! Scores are total log-likelihoods under the quadrature model (higher is
//! better). The procedure:
//!
//! 1. score every cell type as a pure singlet (weight 1, no fit) and keep the
//!    best one, `type1`;
//! 2. for every `t2` outside `type1`'s class, fit the pair `{type1, t2}` with the
//!    non-negative solver, rescale to proportions and score it;
//! 3. compare the best pair against the singlet (`doublet_margin`) and against
//!    the runner-up pair (`confidence_margin`).
//!
//! Both margins are plain score-difference thresholds taken from the config.
//! Near-equal scores resolve toward the singlet, then toward the lower type index.

use nalgebra::DVector;

use crate::domain::{Constraint, DoubletRecord, FitStatus, LocationOutcome, SpotClass};
use crate::error::LocationFailure;
use crate::fit::context::DeconvContext;
use crate::fit::solver::{SolverSettings, WeightSolver};
use crate::models::{design_matrix, predict, select_types, single_type_prediction};

/// Relative tolerance under which two scores count as tied.
const SCORE_TIE_TOL: f64 = 1e-9;

/// `a` beats `b` by more than the tie tolerance.
fn better(a: f64, b: f64) -> bool {
    a > b + SCORE_TIE_TOL * (1.0 + b.abs())
}

#[derive(Debug, Clone, Copy)]
struct PairCandidate {
    second: usize,
    first_weight: f64,
    second_weight: f64,
    score: f64,
}

pub struct DoubletClassifier<'a> {
    ctx: &'a DeconvContext,
    pair_solver: WeightSolver<'a>,
}

impl<'a> DoubletClassifier<'a> {
    pub fn new(ctx: &'a DeconvContext) -> Self {
        let settings =
            SolverSettings::from_config(ctx.config()).with_constraint(Constraint::NonNegative);
        Self {
            ctx,
            pair_solver: WeightSolver::new(ctx.quadrature(), settings),
        }
    }

    pub fn classify(&self, counts: &DVector<f64>, total: f64) -> LocationOutcome<DoubletRecord> {
        if !(total > 0.0) {
            return Err(LocationFailure::EmptyLocation { total });
        }
        let config = self.ctx.config();

        let (first, singlet_score) = self.best_singlet(counts, total);
        if let Some(floor) = config.min_fit_score {
            let per_gene = singlet_score / counts.len().max(1) as f64;
            if per_gene < floor {
                log::debug!("best singlet scores {per_gene:.3} per gene, below floor {floor}");
                return Ok(DoubletRecord::rejected(singlet_score));
            }
        }

        let pairs = self.score_pairs(first, counts, total)?;
        let Some(best) = best_pair(&pairs, None) else {
            return Ok(singlet_record(first, singlet_score, None));
        };

        if !better(best.score, singlet_score + config.doublet_margin) {
            return Ok(singlet_record(first, singlet_score, Some(best.score)));
        }

        let contested = best_pair(&pairs, Some(best.second))
            .is_some_and(|runner_up| best.score - runner_up.score < config.confidence_margin);
        let spot_class = if contested {
            SpotClass::DoubletUncertain
        } else {
            SpotClass::DoubletCertain
        };

        Ok(DoubletRecord {
            spot_class,
            first_type: Some(first),
            second_type: Some(best.second),
            first_weight: best.first_weight,
            second_weight: Some(best.second_weight),
            singlet_score,
            doublet_score: Some(best.score),
        })
    }

    /// Best single-type explanation. Scans in type order, so ties keep the lower index.
    fn best_singlet(&self, counts: &DVector<f64>, total: f64) -> (usize, f64) {
        let quadrature = self.ctx.quadrature();
        let profile = self.ctx.profile();
        let mut best: Option<(usize, f64)> = None;
        for t in 0..self.ctx.n_types() {
            let lambda = single_type_prediction(profile, total, t);
            let score = quadrature.score(counts, &lambda);
            match best {
                Some((_, current)) if !better(score, current) => {}
                _ => best = Some((t, score)),
            }
        }
        best.unwrap_or((0, f64::NEG_INFINITY))
    }

    fn score_pairs(
        &self,
        first: usize,
        counts: &DVector<f64>,
        total: f64,
    ) -> Result<Vec<PairCandidate>, LocationFailure> {
        let classes = self.ctx.classes();
        let quadrature = self.ctx.quadrature();
        let mut pairs = Vec::new();

        for second in 0..self.ctx.n_types() {
            if second == first || classes.same_class(first, second) {
                continue;
            }
            let sub = select_types(self.ctx.profile(), &[first, second]);
            let fit = self.pair_solver.solve(&sub, counts, total)?;
            if matches!(fit.status, FitStatus::Fallback(_)) {
                log::debug!("skipping pair ({first}, {second}) after solver fallback");
                continue;
            }
            let sum = fit.weights.sum();
            if !(sum > 0.0) {
                continue;
            }
            let proportions = fit.weights / sum;
            let lambda = predict(&design_matrix(&sub, total), &proportions);
            pairs.push(PairCandidate {
                second,
                first_weight: proportions[0],
                second_weight: proportions[1],
                score: quadrature.score(counts, &lambda),
            });
        }
        Ok(pairs)
    }
}

/// Highest-scoring pair, optionally excluding one partner. Earlier (lower-index)
/// partners win ties.
fn best_pair(pairs: &[PairCandidate], exclude: Option<usize>) -> Option<PairCandidate> {
    let mut best: Option<PairCandidate> = None;
    for pair in pairs.iter().filter(|p| Some(p.second) != exclude) {
        match best {
            Some(current) if !better(pair.score, current.score) => {}
            _ => best = Some(*pair),
        }
    }
    best
}

fn singlet_record(first: usize, singlet_score: f64, doublet_score: Option<f64>) -> DoubletRecord {
    DoubletRecord {
        spot_class: SpotClass::Singlet,
        first_type: Some(first),
        second_type: None,
        first_weight: 1.0,
        second_weight: None,
        singlet_score,
        doublet_score,
    }
}
