//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and initialises logging
//! - parses CLI arguments
//! - prepares the run context (config, inputs, σ)
//! - runs the batch and prints the summary
//! - writes optional exports

use std::path::Path;

use clap::Parser;

use crate::cli::{Cli, Command, DoubletArgs, FullArgs, SimulateArgs};
use crate::data::simulate;
use crate::error::AppError;
use crate::fit::{BatchScheduler, DoubletResults};
use crate::io::{RunSummary, export, write_summary_json};
use crate::report;

pub mod pipeline;

use pipeline::{Inputs, Prepared};

/// Entry point for the `deconv` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Command::Full(args) => handle_full(args),
        Command::Doublet(args) => handle_doublet(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

fn handle_full(args: FullArgs) -> Result<(), AppError> {
    let config = pipeline::resolve_config(&args.run)?;
    let inputs = pipeline::load_inputs(&args.input)?;
    let prepared = pipeline::prepare_context(
        &inputs,
        config,
        args.run.sigma_sample,
        args.input.platform_normalize,
    )?;
    let ctx = &prepared.ctx;

    let results = BatchScheduler::new(ctx).run_full(&inputs.data)?;
    print_sigma_search(&prepared);
    println!("{}", report::format_full_summary(&results, ctx.quadrature().sigma()));

    if let Some(path) = &args.out {
        export::write_weights_csv(path, &results)?;
    }
    if let Some(path) = &args.run.summary {
        let summary = RunSummary {
            sigma_scores: prepared.sigma_scores.clone(),
            ..RunSummary::for_full(ctx, &results)
        };
        write_summary_json(path, &summary)?;
    }
    Ok(())
}

fn handle_doublet(args: DoubletArgs) -> Result<(), AppError> {
    let config = pipeline::resolve_config(&args.run)?;
    let inputs = pipeline::load_inputs(&args.input)?;
    let prepared = pipeline::prepare_context(
        &inputs,
        config,
        args.run.sigma_sample,
        args.input.platform_normalize,
    )?;

    let results = run_doublet(&prepared, &inputs)?;
    if let Some(path) = &args.out {
        export::write_doublet_csv(path, &results)?;
    }
    if let Some(path) = &args.sparse {
        export::write_sparse_weights_csv(path, &results)?;
    }
    write_doublet_summary(args.run.summary.as_deref(), &prepared, &results, None)
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let config = pipeline::resolve_config(&args.run)?;
    let sim = simulate(&args.spec())?;
    let truth = sim.truth.clone();
    let inputs = Inputs::from_synthetic(sim)?;
    let prepared = pipeline::prepare_context(&inputs, config, args.run.sigma_sample, false)?;

    let results = run_doublet(&prepared, &inputs)?;
    let correct = truth
        .iter()
        .enumerate()
        .filter(|(loc, t)| t.matches(&results.record(*loc)))
        .count();
    let accuracy = correct as f64 / truth.len().max(1) as f64;
    println!(
        "Recovered composition at {correct}/{} locations ({:.1}%)",
        truth.len(),
        100.0 * accuracy
    );

    if let Some(path) = &args.out {
        export::write_doublet_csv(path, &results)?;
    }
    write_doublet_summary(args.run.summary.as_deref(), &prepared, &results, Some(accuracy))
}

fn run_doublet(prepared: &Prepared, inputs: &Inputs) -> Result<DoubletResults, AppError> {
    let ctx = &prepared.ctx;
    let results = BatchScheduler::new(ctx).run_doublet(&inputs.data)?;
    print_sigma_search(prepared);
    println!("{}", report::format_doublet_summary(&results, ctx.quadrature().sigma()));
    Ok(results)
}

fn write_doublet_summary(
    path: Option<&Path>,
    prepared: &Prepared,
    results: &DoubletResults,
    accuracy: Option<f64>,
) -> Result<(), AppError> {
    let Some(path) = path else {
        return Ok(());
    };
    let summary = RunSummary {
        sigma_scores: prepared.sigma_scores.clone(),
        accuracy,
        ..RunSummary::for_doublet(&prepared.ctx, results)
    };
    write_summary_json(path, &summary)?;
    Ok(())
}

fn print_sigma_search(prepared: &Prepared) {
    if let Some(scores) = &prepared.sigma_scores {
        println!(
            "{}",
            report::format_sigma_scores(scores, prepared.ctx.quadrature().sigma())
        );
    }
}
