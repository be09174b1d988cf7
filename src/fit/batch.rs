//! Fan-out of per-location work over a rayon pool.
//!
//! Results are collected by location index (`into_par_iter().map().collect()`
//! preserves order), so the worker count only changes wall-clock time. When the
//! pool cannot be built the same closure runs sequentially.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nalgebra::DMatrix;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::domain::{DoubletRecord, FitStatus, LocationOutcome, SpatialDataset, SpotClass, WeightFit};
use crate::error::{DeconvError, LocationFailure};
use crate::fit::context::DeconvContext;
use crate::fit::doublet::DoubletClassifier;
use crate::fit::solver::{SolverSettings, WeightSolver};

/// How a batch was actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Parallel { workers: usize },
    Sequential,
}

impl std::fmt::Display for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::Parallel { workers } => write!(f, "parallel ({workers} workers)"),
            Execution::Sequential => write!(f, "sequential"),
        }
    }
}

/// Run `job` for every index in `0..n`, returning results in index order.
///
/// `max_workers == 1` runs sequentially; `0` lets rayon choose.
pub(crate) fn fan_out<T, F>(n: usize, max_workers: usize, job: F) -> (Vec<T>, Execution)
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if max_workers == 1 {
        return ((0..n).map(job).collect(), Execution::Sequential);
    }
    let mut builder = ThreadPoolBuilder::new();
    if max_workers > 0 {
        builder = builder.num_threads(max_workers);
    }
    fan_out_on(builder.build(), n, job)
}

/// Run on `pool`, or sequentially when it could not be built.
pub(crate) fn fan_out_on<T, F>(
    pool: Result<ThreadPool, ThreadPoolBuildError>,
    n: usize,
    job: F,
) -> (Vec<T>, Execution)
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    match pool {
        Ok(pool) => {
            let workers = pool.current_num_threads();
            let out = pool.install(|| (0..n).into_par_iter().map(&job).collect());
            (out, Execution::Parallel { workers })
        }
        Err(e) => {
            log::warn!("worker pool unavailable ({e}); running sequentially");
            ((0..n).map(job).collect(), Execution::Sequential)
        }
    }
}

/// Short status label for a full-mode outcome.
pub fn outcome_label(outcome: &LocationOutcome<WeightFit>) -> &'static str {
    match outcome {
        Ok(fit) => fit.status.label(),
        Err(LocationFailure::EmptyLocation { .. }) => "empty",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub converged: usize,
    pub iteration_cap: usize,
    pub fallback: usize,
    pub empty: usize,
}

/// Full-mode batch output, one outcome per location in input order.
#[derive(Debug, Clone)]
pub struct FullResults {
    pub locations: Vec<String>,
    pub cell_types: Vec<String>,
    pub outcomes: Vec<LocationOutcome<WeightFit>>,
    pub execution: Execution,
    pub elapsed: Duration,
}

impl FullResults {
    /// Locations × cell types. Rows of failed locations are zero.
    pub fn weight_matrix(&self) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.locations.len(), self.cell_types.len());
        for (loc, outcome) in self.outcomes.iter().enumerate() {
            if let Ok(fit) = outcome {
                out.row_mut(loc).copy_from(&fit.weights.transpose());
            }
        }
        out
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for outcome in &self.outcomes {
            match outcome {
                Ok(fit) => match fit.status {
                    FitStatus::Converged => counts.converged += 1,
                    FitStatus::IterationCap => counts.iteration_cap += 1,
                    FitStatus::Fallback(_) => counts.fallback += 1,
                },
                Err(LocationFailure::EmptyLocation { .. }) => counts.empty += 1,
            }
        }
        counts
    }
}

/// One non-zero entry of the doublet-mode sparse weight matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparseWeight {
    pub location: usize,
    pub cell_type: usize,
    pub weight: f64,
}

/// Doublet-mode batch output, one outcome per location in input order.
#[derive(Debug, Clone)]
pub struct DoubletResults {
    pub locations: Vec<String>,
    pub cell_types: Vec<String>,
    pub outcomes: Vec<LocationOutcome<DoubletRecord>>,
    pub execution: Execution,
    pub elapsed: Duration,
}

impl DoubletResults {
    /// The record for a location, with failed locations reported as rejects.
    pub fn record(&self, location: usize) -> DoubletRecord {
        match &self.outcomes[location] {
            Ok(record) => record.clone(),
            Err(_) => DoubletRecord::rejected(f64::NAN),
        }
    }

    /// Non-zero weights in location order, first type before second.
    pub fn sparse_weights(&self) -> Vec<SparseWeight> {
        let mut out = Vec::new();
        for (location, outcome) in self.outcomes.iter().enumerate() {
            let Ok(record) = outcome else { continue };
            let Some(first) = record.first_type else { continue };
            let mut push = |cell_type: usize, weight: f64| {
                if weight > 0.0 {
                    out.push(SparseWeight {
                        location,
                        cell_type,
                        weight,
                    });
                }
            };
            push(first, record.first_weight);
            if let (Some(second), Some(weight)) = (record.second_type, record.second_weight) {
                push(second, weight);
            }
        }
        out
    }

    /// Dense locations × cell types view of `sparse_weights`.
    pub fn weight_matrix(&self) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.locations.len(), self.cell_types.len());
        for entry in self.sparse_weights() {
            out[(entry.location, entry.cell_type)] = entry.weight;
        }
        out
    }

    /// Locations per spot class. Failed locations count as rejects.
    pub fn class_counts(&self) -> BTreeMap<SpotClass, usize> {
        let mut counts: BTreeMap<SpotClass, usize> =
            SpotClass::ALL.iter().map(|c| (*c, 0)).collect();
        for outcome in &self.outcomes {
            let class = match outcome {
                Ok(record) => record.spot_class,
                Err(_) => SpotClass::Reject,
            };
            *counts.entry(class).or_default() += 1;
        }
        counts
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }
}

/// Applies the solver or the classifier to every location of a dataset.
pub struct BatchScheduler<'a> {
    ctx: &'a DeconvContext,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(ctx: &'a DeconvContext) -> Self {
        Self { ctx }
    }

    /// Weight fit for every location.
    pub fn run_full(&self, data: &SpatialDataset) -> Result<FullResults, DeconvError> {
        let bound = self.ctx.bind(data)?;
        let solver = WeightSolver::new(
            self.ctx.quadrature(),
            SolverSettings::from_config(self.ctx.config()),
        );
        let profile = self.ctx.profile();

        log::info!(
            "full mode: {} locations, {}",
            bound.n_locations(),
            self.ctx.config().mode.display_name()
        );
        let start = Instant::now();
        let (outcomes, execution) =
            fan_out(bound.n_locations(), self.ctx.config().max_workers, |loc| {
                let (counts, total) = bound.observation(loc);
                solver.solve(profile, &counts, total)
            });
        let elapsed = start.elapsed();

        let results = FullResults {
            locations: bound.locations().to_vec(),
            cell_types: self.ctx.cell_types().to_vec(),
            outcomes,
            execution,
            elapsed,
        };
        let status = results.status_counts();
        log::info!(
            "full mode done in {:.2?} ({execution}): {} converged, {} at cap, {} fallback, {} empty",
            elapsed,
            status.converged,
            status.iteration_cap,
            status.fallback,
            status.empty
        );
        if status.iteration_cap > 0 {
            log::warn!(
                "{} locations stopped at the iteration cap ({})",
                status.iteration_cap,
                self.ctx.config().max_iterations
            );
        }
        Ok(results)
    }

    /// Singlet / doublet classification for every location.
    pub fn run_doublet(&self, data: &SpatialDataset) -> Result<DoubletResults, DeconvError> {
        let bound = self.ctx.bind(data)?;
        let classifier = DoubletClassifier::new(self.ctx);

        log::info!("doublet mode: {} locations", bound.n_locations());
        let start = Instant::now();
        let (outcomes, execution) =
            fan_out(bound.n_locations(), self.ctx.config().max_workers, |loc| {
                let (counts, total) = bound.observation(loc);
                classifier.classify(&counts, total)
            });
        let elapsed = start.elapsed();

        let results = DoubletResults {
            locations: bound.locations().to_vec(),
            cell_types: self.ctx.cell_types().to_vec(),
            outcomes,
            execution,
            elapsed,
        };
        log::info!(
            "doublet mode done in {:.2?} ({execution}), {} failed locations",
            elapsed,
            results.failures()
        );
        Ok(results)
    }
}
