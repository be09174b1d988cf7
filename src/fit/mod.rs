//! Per-location fitting and its orchestration.
//!
//! Responsibilities:
//!
//! - bundle the read-only run state (`DeconvContext`)
//! - fit mixture weights for one location (`WeightSolver`)
//! - classify locations as singlets or doublets (`DoubletClassifier`)
//! - fan both out across a dataset deterministically (`BatchScheduler`)
//! - pick the dispersion σ and the bulk platform adjustment before a run

pub mod batch;
pub mod bulk;
pub mod context;
pub mod doublet;
pub mod sigma;
pub mod solver;

pub use batch::*;
pub use bulk::*;
pub use context::*;
pub use doublet::*;
pub use sigma::*;
pub use solver::*;
