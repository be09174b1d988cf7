//! JSON run summary.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::DeconvConfig;
use crate::error::DeconvError;
use crate::fit::{DeconvContext, DoubletResults, FullResults};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tool: String,
    pub generated_at: DateTime<Utc>,
    /// `full` or `doublet`.
    pub mode: String,
    pub sigma: f64,
    pub n_locations: usize,
    pub n_genes: usize,
    pub cell_types: Vec<String>,
    pub execution: String,
    pub elapsed_secs: f64,
    pub config: DeconvConfig,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_counts: Option<BTreeMap<String, usize>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub class_counts: Option<BTreeMap<String, usize>>,
    /// `(σ, log-likelihood)` per candidate when σ was chosen from data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sigma_scores: Option<Vec<(f64, f64)>>,
    /// Share of synthetic locations whose composition was recovered.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accuracy: Option<f64>,
}

impl RunSummary {
    fn base(ctx: &DeconvContext, mode: &str, n_locations: usize) -> Self {
        Self {
            tool: "deconv".to_string(),
            generated_at: Utc::now(),
            mode: mode.to_string(),
            sigma: ctx.quadrature().sigma(),
            n_locations,
            n_genes: ctx.genes().len(),
            cell_types: ctx.cell_types().to_vec(),
            execution: String::new(),
            elapsed_secs: 0.0,
            config: ctx.config().clone(),
            status_counts: None,
            class_counts: None,
            sigma_scores: None,
            accuracy: None,
        }
    }

    pub fn for_full(ctx: &DeconvContext, results: &FullResults) -> Self {
        let s = results.status_counts();
        let status = [
            ("converged", s.converged),
            ("iteration_cap", s.iteration_cap),
            ("fallback", s.fallback),
            ("empty", s.empty),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            execution: results.execution.to_string(),
            elapsed_secs: results.elapsed.as_secs_f64(),
            status_counts: Some(status),
            ..Self::base(ctx, "full", results.locations.len())
        }
    }

    pub fn for_doublet(ctx: &DeconvContext, results: &DoubletResults) -> Self {
        let classes = results
            .class_counts()
            .into_iter()
            .map(|(class, n)| (class.label().to_string(), n))
            .collect();
        Self {
            execution: results.execution.to_string(),
            elapsed_secs: results.elapsed.as_secs_f64(),
            class_counts: Some(classes),
            ..Self::base(ctx, "doublet", results.locations.len())
        }
    }
}

pub fn write_summary_json(path: &Path, summary: &RunSummary) -> Result<(), DeconvError> {
    let file = File::create(path).map_err(|e| DeconvError::Io {
        path: path.display().to_string(),
        message: format!("failed to create summary JSON: {e}"),
    })?;
    serde_json::to_writer_pretty(file, summary).map_err(|e| DeconvError::Io {
        path: path.display().to_string(),
        message: format!("failed to write summary JSON: {e}"),
    })
}

pub fn read_summary_json(path: &Path) -> Result<RunSummary, DeconvError> {
    let file = File::open(path).map_err(|e| DeconvError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_reader(file).map_err(|e| DeconvError::Parse {
        path: path.display().to_string(),
        line: e.line(),
        message: format!("invalid summary JSON: {e}"),
    })
}
