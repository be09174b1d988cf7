//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable where they
//! cross the IO boundary:
//!
//! - inputs: `ReferenceProfile`, `SpatialDataset`, `GeneSet`, `ClassMapping`
//! - configuration: `DeconvConfig` and the tagged `SolveMode`
//! - outputs: `WeightFit`, `DoubletRecord` and their batch collections

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{DeconvError, LocationFailure, SolverFault};

/// Genes × cell-types matrix of expected per-unit-count expression.
#[derive(Debug, Clone)]
pub struct ReferenceProfile {
    genes: Vec<String>,
    cell_types: Vec<String>,
    values: DMatrix<f64>,
}

impl ReferenceProfile {
    pub fn new(
        genes: Vec<String>,
        cell_types: Vec<String>,
        values: DMatrix<f64>,
    ) -> Result<Self, DeconvError> {
        if cell_types.is_empty() {
            return Err(DeconvError::NoCellTypes);
        }
        if values.nrows() != genes.len() || values.ncols() != cell_types.len() {
            return Err(DeconvError::ShapeMismatch(format!(
                "reference matrix is {}x{} but has {} genes and {} cell types",
                values.nrows(),
                values.ncols(),
                genes.len(),
                cell_types.len()
            )));
        }
        ensure_unique(&genes, "reference gene")?;
        ensure_unique(&cell_types, "cell type")?;
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(DeconvError::InvalidData(
                "reference profile values must be finite and non-negative".to_string(),
            ));
        }
        Ok(Self {
            genes,
            cell_types,
            values,
        })
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn cell_types(&self) -> &[String] {
        &self.cell_types
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn n_types(&self) -> usize {
        self.cell_types.len()
    }

    pub fn gene_index(&self) -> HashMap<&str, usize> {
        index_of(&self.genes)
    }
}

/// Genes × locations raw count matrix with per-location total counts.
#[derive(Debug, Clone)]
pub struct SpatialDataset {
    genes: Vec<String>,
    locations: Vec<String>,
    counts: DMatrix<f64>,
    totals: Vec<f64>,
}

impl SpatialDataset {
    pub fn new(
        genes: Vec<String>,
        locations: Vec<String>,
        counts: DMatrix<f64>,
        totals: Vec<f64>,
    ) -> Result<Self, DeconvError> {
        if counts.nrows() != genes.len() || counts.ncols() != locations.len() {
            return Err(DeconvError::ShapeMismatch(format!(
                "count matrix is {}x{} but has {} genes and {} locations",
                counts.nrows(),
                counts.ncols(),
                genes.len(),
                locations.len()
            )));
        }
        if totals.len() != locations.len() {
            return Err(DeconvError::ShapeMismatch(format!(
                "{} totals for {} locations",
                totals.len(),
                locations.len()
            )));
        }
        ensure_unique(&genes, "spatial gene")?;
        ensure_unique(&locations, "location")?;
        if counts.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(DeconvError::InvalidData(
                "counts must be finite and non-negative".to_string(),
            ));
        }
        if totals.iter().any(|v| !v.is_finite()) {
            return Err(DeconvError::InvalidData(
                "location totals must be finite".to_string(),
            ));
        }
        Ok(Self {
            genes,
            locations,
            counts,
            totals,
        })
    }

    /// Build a dataset whose totals are the column sums of `counts`.
    pub fn with_column_totals(
        genes: Vec<String>,
        locations: Vec<String>,
        counts: DMatrix<f64>,
    ) -> Result<Self, DeconvError> {
        let totals = counts.column_iter().map(|c| c.sum()).collect();
        Self::new(genes, locations, counts, totals)
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    pub fn counts(&self) -> &DMatrix<f64> {
        &self.counts
    }

    pub fn totals(&self) -> &[f64] {
        &self.totals
    }

    pub fn n_locations(&self) -> usize {
        self.locations.len()
    }

    pub fn gene_index(&self) -> HashMap<&str, usize> {
        index_of(&self.genes)
    }
}

/// Ordered set of genes entering the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneSet {
    genes: Vec<String>,
}

impl GeneSet {
    pub fn new(genes: Vec<String>) -> Result<Self, DeconvError> {
        if genes.is_empty() {
            return Err(DeconvError::EmptyGeneSet);
        }
        ensure_unique(&genes, "gene set entry")?;
        Ok(Self { genes })
    }

    /// Genes present in both inputs with non-zero reference signal, in reference order.
    pub fn shared(reference: &ReferenceProfile, data: &SpatialDataset) -> Result<Self, DeconvError> {
        let spatial = data.gene_index();
        let genes = reference
            .genes()
            .iter()
            .enumerate()
            .filter(|(g, name)| {
                spatial.contains_key(name.as_str()) && reference.values().row(*g).sum() > 0.0
            })
            .map(|(_, name)| name.clone())
            .collect();
        Self::new(genes)
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

/// Cell type → coarse class. Two types in the same class are never reported as a doublet pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMapping {
    classes: Vec<String>,
}

impl ClassMapping {
    /// Every cell type is its own class.
    pub fn identity(cell_types: &[String]) -> Self {
        Self {
            classes: cell_types.to_vec(),
        }
    }

    /// Build from `(cell_type, class)` pairs. Types not listed keep their own name as class.
    pub fn from_pairs(
        cell_types: &[String],
        pairs: &[(String, String)],
    ) -> Result<Self, DeconvError> {
        let index = index_of(cell_types);
        let mut classes = cell_types.to_vec();
        for (cell_type, class) in pairs {
            let Some(&t) = index.get(cell_type.as_str()) else {
                return Err(DeconvError::InvalidData(format!(
                    "class mapping names unknown cell type '{cell_type}'"
                )));
            };
            classes[t] = class.clone();
        }
        Ok(Self { classes })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn same_class(&self, a: usize, b: usize) -> bool {
        self.classes[a] == self.classes[b]
    }
}

/// Constraint set applied to the weight vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// `w ≥ 0` and `Σw = 1`.
    SumToOne,
    /// `w ≥ 0` only.
    NonNegative,
}

/// How the weight solver treats one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMode {
    /// Iteratively reweighted least squares with variances from the quadrature model.
    Irwls(Constraint),
    /// One least-squares pass with unit variances.
    Ols(Constraint),
}

impl SolveMode {
    pub fn from_flags(constrain: bool, ols: bool) -> Self {
        let constraint = if constrain {
            Constraint::SumToOne
        } else {
            Constraint::NonNegative
        };
        if ols {
            SolveMode::Ols(constraint)
        } else {
            SolveMode::Irwls(constraint)
        }
    }

    pub fn constraint(self) -> Constraint {
        match self {
            SolveMode::Irwls(c) | SolveMode::Ols(c) => c,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SolveMode::Irwls(Constraint::SumToOne) => "IRWLS (sum-to-one)",
            SolveMode::Irwls(Constraint::NonNegative) => "IRWLS (non-negative)",
            SolveMode::Ols(Constraint::SumToOne) => "OLS (sum-to-one)",
            SolveMode::Ols(Constraint::NonNegative) => "OLS (non-negative)",
        }
    }
}

/// Shape of the expected-count grid and the count-noise quadrature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadratureSettings {
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub grid_points: usize,
    /// Largest tabulated count; larger counts are evaluated from the quadrature rule.
    pub count_cap: usize,
    pub hermite_nodes: usize,
}

impl Default for QuadratureSettings {
    fn default() -> Self {
        Self {
            lambda_min: 0.01,
            lambda_max: 1e4,
            grid_points: 400,
            count_cap: 200,
            hermite_nodes: 31,
        }
    }
}

/// The full run configuration.
///
/// Derived from an optional TOML file, then CLI flags (plus defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvConfig {
    pub mode: SolveMode,
    /// Worker threads for the batch. `0` lets rayon pick; `1` runs sequentially.
    pub max_workers: usize,
    /// Dispersion σ. `None` means "choose from candidates".
    pub sigma: Option<f64>,
    /// Convergence threshold on the L1 change of the weights between iterations.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Minimum log-likelihood gain of the best pair over the best singlet to call a doublet.
    pub doublet_margin: f64,
    /// A competing pair within this log-likelihood distance makes a doublet uncertain.
    pub confidence_margin: f64,
    /// Per-gene mean log-likelihood floor for the best singlet; below it the location is rejected.
    pub min_fit_score: Option<f64>,
    pub quadrature: QuadratureSettings,
}

impl Default for DeconvConfig {
    fn default() -> Self {
        Self {
            mode: SolveMode::Irwls(Constraint::SumToOne),
            max_workers: 0,
            sigma: None,
            tolerance: 1e-6,
            max_iterations: 50,
            doublet_margin: 25.0,
            confidence_margin: 10.0,
            min_fit_score: None,
            quadrature: QuadratureSettings::default(),
        }
    }
}

impl DeconvConfig {
    pub fn validate(&self) -> Result<(), DeconvError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(DeconvError::InvalidConfig(format!(
                "tolerance must be finite and > 0 (got {})",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(DeconvError::InvalidConfig(
                "max_iterations must be >= 1".to_string(),
            ));
        }
        if let Some(sigma) = self.sigma {
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(DeconvError::InvalidConfig(format!(
                    "sigma must be finite and > 0 (got {sigma})"
                )));
            }
        }
        for (name, value) in [
            ("doublet_margin", self.doublet_margin),
            ("confidence_margin", self.confidence_margin),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(DeconvError::InvalidConfig(format!(
                    "{name} must be finite and >= 0 (got {value})"
                )));
            }
        }
        if let Some(floor) = self.min_fit_score {
            if !floor.is_finite() {
                return Err(DeconvError::InvalidConfig(
                    "min_fit_score must be finite".to_string(),
                ));
            }
        }
        let q = &self.quadrature;
        if q.hermite_nodes == 0 {
            return Err(DeconvError::InvalidConfig(
                "hermite_nodes must be >= 1".to_string(),
            ));
        }
        if q.grid_points < 2 {
            return Err(DeconvError::InvalidConfig(
                "grid_points must be >= 2".to_string(),
            ));
        }
        if !(q.lambda_min.is_finite() && q.lambda_min > 0.0 && q.lambda_max > q.lambda_min) {
            return Err(DeconvError::InvalidConfig(format!(
                "invalid lambda range [{}, {}]",
                q.lambda_min, q.lambda_max
            )));
        }
        Ok(())
    }
}

/// How a single-location solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    /// The IRWLS loop or the active-set QP reached its cap; the last iterate is returned.
    IterationCap,
    /// The QP step failed; weights are the documented fallback.
    Fallback(SolverFault),
}

impl FitStatus {
    pub fn label(self) -> &'static str {
        match self {
            FitStatus::Converged => "converged",
            FitStatus::IterationCap => "iteration_cap",
            FitStatus::Fallback(_) => "fallback",
        }
    }
}

/// Output of one WeightSolver call.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightFit {
    pub weights: DVector<f64>,
    pub iterations: usize,
    pub status: FitStatus,
}

/// Terminal classification labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotClass {
    Singlet,
    DoubletCertain,
    DoubletUncertain,
    Reject,
}

impl SpotClass {
    pub const ALL: [SpotClass; 4] = [
        SpotClass::Singlet,
        SpotClass::DoubletCertain,
        SpotClass::DoubletUncertain,
        SpotClass::Reject,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SpotClass::Singlet => "singlet",
            SpotClass::DoubletCertain => "doublet_certain",
            SpotClass::DoubletUncertain => "doublet_uncertain",
            SpotClass::Reject => "reject",
        }
    }
}

/// Per-location doublet-mode result.
#[derive(Debug, Clone, PartialEq)]
pub struct DoubletRecord {
    pub spot_class: SpotClass,
    /// Index into the reference cell types. `None` only for `Reject`.
    pub first_type: Option<usize>,
    pub second_type: Option<usize>,
    pub first_weight: f64,
    pub second_weight: Option<f64>,
    /// Log-likelihood of the best singlet model.
    pub singlet_score: f64,
    /// Log-likelihood of the best pair, when any pair was evaluated.
    pub doublet_score: Option<f64>,
}

impl DoubletRecord {
    pub fn rejected(singlet_score: f64) -> Self {
        Self {
            spot_class: SpotClass::Reject,
            first_type: None,
            second_type: None,
            first_weight: 0.0,
            second_weight: None,
            singlet_score,
            doublet_score: None,
        }
    }
}

/// Per-location outcome as stored by the batch.
pub type LocationOutcome<T> = Result<T, LocationFailure>;

fn ensure_unique(names: &[String], what: &str) -> Result<(), DeconvError> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(DeconvError::InvalidData(format!("duplicate {what} '{name}'")));
        }
    }
    Ok(())
}

fn index_of(names: &[String]) -> HashMap<&str, usize> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect()
}
