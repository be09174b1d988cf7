//! Command-line parsing for the `deconv` binary.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! fitting code. Every run option is an override on top of the TOML config (or
//! its defaults); `apply_overrides` is the single place that merges them.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::data::SimulationSpec;
use crate::domain::{Constraint, DeconvConfig, SolveMode};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "deconv",
    version,
    about = "Cell-type deconvolution of spatial transcriptomics counts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit a weight for every cell type at every location.
    Full(FullArgs),
    /// Classify every location as singlet, doublet or reject.
    Doublet(DoubletArgs),
    /// Generate a synthetic dataset, run doublet mode on it and report accuracy.
    Simulate(SimulateArgs),
}

/// Input files shared by `full` and `doublet`.
#[derive(Debug, Args, Clone)]
pub struct InputArgs {
    /// Reference profile CSV (`gene,<cell type...>`).
    #[arg(long, value_name = "CSV")]
    pub reference: PathBuf,

    /// Spatial count CSV (`gene,<location...>`).
    #[arg(long, value_name = "CSV")]
    pub counts: PathBuf,

    /// Per-location totals CSV (`location,total`). Defaults to column sums of the counts.
    #[arg(long, value_name = "CSV")]
    pub totals: Option<PathBuf>,

    /// Gene list, one per line. Defaults to shared genes with reference signal.
    #[arg(long, value_name = "FILE")]
    pub genes: Option<PathBuf>,

    /// Cell-type class CSV (`cell_type,class`). Defaults to one class per type.
    #[arg(long, value_name = "CSV")]
    pub classes: Option<PathBuf>,

    /// Fit a pseudo-bulk first and adjust the reference for platform effects.
    #[arg(long)]
    pub platform_normalize: bool,
}

/// Solver and scheduling options shared by every subcommand.
#[derive(Debug, Args, Clone, Default)]
pub struct RunArgs {
    /// TOML config file; flags below override its values.
    #[arg(long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Dispersion sigma. Chosen from the data when omitted.
    #[arg(long)]
    pub sigma: Option<f64>,

    /// Locations used to choose sigma.
    #[arg(long, default_value_t = 100)]
    pub sigma_sample: usize,

    /// Worker threads (0 = all cores, 1 = sequential).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Drop the sum-to-one constraint (weights stay non-negative).
    #[arg(long)]
    pub unconstrained: bool,

    /// Single least-squares pass without variance reweighting.
    #[arg(long)]
    pub ols: bool,

    /// Convergence threshold on the L1 change of the weights.
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// IRWLS iteration cap.
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Log-likelihood gain a pair needs over the best singlet.
    #[arg(long)]
    pub doublet_margin: Option<f64>,

    /// Runner-up pairs within this distance make a doublet uncertain.
    #[arg(long)]
    pub confidence_margin: Option<f64>,

    /// Per-gene mean log-likelihood floor below which a location is rejected.
    #[arg(long)]
    pub min_fit_score: Option<f64>,

    /// Write a JSON run summary.
    #[arg(long, value_name = "JSON")]
    pub summary: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct FullArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub run: RunArgs,

    /// Export the weight matrix to CSV.
    #[arg(long, value_name = "CSV")]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct DoubletArgs {
    #[command(flatten)]
    pub input: InputArgs,

    #[command(flatten)]
    pub run: RunArgs,

    /// Export per-location records to CSV.
    #[arg(long, value_name = "CSV")]
    pub out: Option<PathBuf>,

    /// Export the sparse weight matrix to CSV.
    #[arg(long, value_name = "CSV")]
    pub sparse: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 6)]
    pub types: usize,

    /// Marker genes per cell type.
    #[arg(long, default_value_t = 5)]
    pub markers: usize,

    #[arg(long, default_value_t = 200)]
    pub locations: usize,

    /// Share of locations that mix two cell types.
    #[arg(long, default_value_t = 0.3)]
    pub doublet_fraction: f64,

    /// Mean total count per location.
    #[arg(long, default_value_t = 500.0)]
    pub mean_total: f64,

    /// Log-scale sd of the count noise used for generation.
    #[arg(long, default_value_t = 0.3)]
    pub noise_sigma: f64,

    #[arg(long, default_value_t = 7)]
    pub seed: u64,

    #[command(flatten)]
    pub run: RunArgs,

    /// Export per-location records to CSV.
    #[arg(long, value_name = "CSV")]
    pub out: Option<PathBuf>,
}

impl SimulateArgs {
    pub fn spec(&self) -> SimulationSpec {
        SimulationSpec {
            n_types: self.types,
            markers_per_type: self.markers,
            n_locations: self.locations,
            doublet_fraction: self.doublet_fraction,
            mean_total: self.mean_total,
            sigma: self.noise_sigma,
            seed: self.seed,
        }
    }
}

/// Merge CLI flags into a config loaded from file (or defaults).
pub fn apply_overrides(mut config: DeconvConfig, run: &RunArgs) -> DeconvConfig {
    let constrain = config.mode.constraint() == Constraint::SumToOne && !run.unconstrained;
    let ols = matches!(config.mode, SolveMode::Ols(_)) || run.ols;
    config.mode = SolveMode::from_flags(constrain, ols);

    if let Some(sigma) = run.sigma {
        config.sigma = Some(sigma);
    }
    if let Some(workers) = run.workers {
        config.max_workers = workers;
    }
    if let Some(tolerance) = run.tolerance {
        config.tolerance = tolerance;
    }
    if let Some(max_iterations) = run.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(margin) = run.doublet_margin {
        config.doublet_margin = margin;
    }
    if let Some(margin) = run.confidence_margin {
        config.confidence_margin = margin;
    }
    if let Some(floor) = run.min_fit_score {
        config.min_fit_score = Some(floor);
    }
    config
}
