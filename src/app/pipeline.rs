//! Shared run preparation used by every subcommand.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! config -> inputs -> context -> (platform adjustment) -> (σ search)
//!
//! The command handlers can then focus on running the batch and presenting it.

use crate::cli::{InputArgs, RunArgs, apply_overrides};
use crate::data::SyntheticData;
use crate::domain::{ClassMapping, DeconvConfig, GeneSet, ReferenceProfile, SpatialDataset};
use crate::error::DeconvError;
use crate::fit::{DeconvContext, choose_sigma, default_sigma_candidates, fit_bulk};
use crate::io::ingest;
use crate::models::QuadratureModel;

/// σ used for the pre-search context (bulk fit) when none is configured.
const PROVISIONAL_SIGMA: f64 = 1.0;

/// Validated inputs for one run.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub reference: ReferenceProfile,
    pub data: SpatialDataset,
    pub genes: GeneSet,
    pub classes: ClassMapping,
}

impl Inputs {
    /// Synthetic data with the default gene set and one class per type.
    pub fn from_synthetic(sim: SyntheticData) -> Result<Self, DeconvError> {
        let genes = GeneSet::shared(&sim.reference, &sim.data)?;
        let classes = ClassMapping::identity(sim.reference.cell_types());
        Ok(Self {
            reference: sim.reference,
            data: sim.data,
            genes,
            classes,
        })
    }
}

/// The ready-to-run context plus what was learned while building it.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub ctx: DeconvContext,
    pub sigma_scores: Option<Vec<(f64, f64)>>,
}

/// Config file (if any), then CLI overrides, then validation.
pub fn resolve_config(run: &RunArgs) -> Result<DeconvConfig, DeconvError> {
    let base = match &run.config {
        Some(path) => ingest::load_config(path)?,
        None => DeconvConfig::default(),
    };
    let config = apply_overrides(base, run);
    config.validate()?;
    Ok(config)
}

pub fn load_inputs(args: &InputArgs) -> Result<Inputs, DeconvError> {
    let reference = ingest::load_reference(&args.reference)?;
    let data = ingest::load_counts(&args.counts, args.totals.as_deref())?;
    let genes = match &args.genes {
        Some(path) => ingest::load_gene_list(path)?,
        None => GeneSet::shared(&reference, &data)?,
    };
    let classes = match &args.classes {
        Some(path) => ingest::load_class_mapping(path, reference.cell_types())?,
        None => ClassMapping::identity(reference.cell_types()),
    };
    Ok(Inputs {
        reference,
        data,
        genes,
        classes,
    })
}

/// Build the worker context, applying the platform adjustment and σ search as requested.
pub fn prepare_context(
    inputs: &Inputs,
    config: DeconvConfig,
    sigma_sample: usize,
    platform_normalize: bool,
) -> Result<Prepared, DeconvError> {
    let sigma = config.sigma.unwrap_or(PROVISIONAL_SIGMA);
    let quadrature = QuadratureModel::build(sigma, &config.quadrature)?;
    let search = config.sigma.is_none();
    let mut ctx = DeconvContext::new(
        &inputs.reference,
        inputs.genes.clone(),
        inputs.classes.clone(),
        quadrature,
        config,
    )?;

    if platform_normalize {
        let bulk = fit_bulk(&ctx, &inputs.data)?;
        let proportions = bulk
            .proportions
            .iter()
            .zip(ctx.cell_types())
            .map(|(p, t)| format!("{t}={p:.3}"))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!("bulk proportions: {proportions}");
        ctx = ctx.with_profile(bulk.adjusted_profile(ctx.profile()))?;
    }

    let mut sigma_scores = None;
    if search {
        let choice = choose_sigma(&ctx, &inputs.data, &default_sigma_candidates(), sigma_sample)?;
        sigma_scores = Some(choice.scores);
        ctx = ctx.with_quadrature(choice.model);
    }

    Ok(Prepared { ctx, sigma_scores })
}
