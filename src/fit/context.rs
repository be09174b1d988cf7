//! The immutable bundle shared by every worker.
//!
//! A `DeconvContext` is built once per run from the reference profile, gene set,
//! class mapping, quadrature model and configuration. Workers only ever see it by
//! shared reference. Binding a spatial dataset resolves every gene to a row up
//! front, so a gene missing from either input aborts the run before any location
//! is solved.

use nalgebra::{DMatrix, DVector};

use crate::domain::{ClassMapping, DeconvConfig, GeneSet, ReferenceProfile, SpatialDataset};
use crate::error::{DeconvError, GeneSource};
use crate::models::QuadratureModel;

#[derive(Debug, Clone)]
pub struct DeconvContext {
    genes: GeneSet,
    cell_types: Vec<String>,
    /// Reference restricted to the gene set: |genes| × |cell types|.
    profile: DMatrix<f64>,
    classes: ClassMapping,
    quadrature: QuadratureModel,
    config: DeconvConfig,
}

impl DeconvContext {
    pub fn new(
        reference: &ReferenceProfile,
        genes: GeneSet,
        classes: ClassMapping,
        quadrature: QuadratureModel,
        config: DeconvConfig,
    ) -> Result<Self, DeconvError> {
        config.validate()?;
        if classes.len() != reference.n_types() {
            return Err(DeconvError::ShapeMismatch(format!(
                "class mapping covers {} cell types, reference has {}",
                classes.len(),
                reference.n_types()
            )));
        }

        let rows = resolve_rows(&genes, &reference.gene_index(), GeneSource::Reference)?;
        let profile = reference.values().select_rows(&rows);

        for (g, name) in genes.genes().iter().enumerate() {
            if profile.row(g).sum() <= 0.0 {
                log::warn!("gene '{name}' has no reference signal in any cell type");
            }
        }

        log::info!(
            "context: {} genes, {} cell types, sigma={:.3}, mode={}",
            genes.len(),
            reference.n_types(),
            quadrature.sigma(),
            config.mode.display_name()
        );

        Ok(Self {
            genes,
            cell_types: reference.cell_types().to_vec(),
            profile,
            classes,
            quadrature,
            config,
        })
    }

    /// Same context with a different quadrature model (σ search).
    pub fn with_quadrature(&self, quadrature: QuadratureModel) -> Self {
        Self {
            quadrature,
            ..self.clone()
        }
    }

    /// Same context with a replacement gene-restricted profile (platform adjustment).
    pub fn with_profile(&self, profile: DMatrix<f64>) -> Result<Self, DeconvError> {
        if profile.shape() != self.profile.shape() {
            return Err(DeconvError::ShapeMismatch(format!(
                "adjusted profile is {:?}, expected {:?}",
                profile.shape(),
                self.profile.shape()
            )));
        }
        Ok(Self {
            profile,
            ..self.clone()
        })
    }

    pub fn genes(&self) -> &GeneSet {
        &self.genes
    }

    pub fn cell_types(&self) -> &[String] {
        &self.cell_types
    }

    pub fn n_types(&self) -> usize {
        self.cell_types.len()
    }

    pub fn profile(&self) -> &DMatrix<f64> {
        &self.profile
    }

    pub fn classes(&self) -> &ClassMapping {
        &self.classes
    }

    pub fn quadrature(&self) -> &QuadratureModel {
        &self.quadrature
    }

    pub fn config(&self) -> &DeconvConfig {
        &self.config
    }

    /// Resolve the gene set against a spatial dataset.
    pub fn bind<'a>(&self, data: &'a SpatialDataset) -> Result<BoundDataset<'a>, DeconvError> {
        let rows = resolve_rows(&self.genes, &data.gene_index(), GeneSource::Spatial)?;
        Ok(BoundDataset { data, rows })
    }
}

/// A spatial dataset with gene-set rows resolved.
#[derive(Debug, Clone)]
pub struct BoundDataset<'a> {
    data: &'a SpatialDataset,
    rows: Vec<usize>,
}

impl BoundDataset<'_> {
    pub fn n_locations(&self) -> usize {
        self.data.n_locations()
    }

    pub fn locations(&self) -> &[String] {
        self.data.locations()
    }

    /// Gene-set counts and total count for one location.
    pub fn observation(&self, location: usize) -> (DVector<f64>, f64) {
        let counts = self.data.counts();
        let b = DVector::from_iterator(
            self.rows.len(),
            self.rows.iter().map(|&r| counts[(r, location)]),
        );
        (b, self.data.totals()[location])
    }

    /// Gene-set counts summed over all locations, and the summed total.
    pub fn aggregate(&self) -> (DVector<f64>, f64) {
        let counts = self.data.counts();
        let b = DVector::from_iterator(
            self.rows.len(),
            self.rows.iter().map(|&r| counts.row(r).sum()),
        );
        let total = self.data.totals().iter().filter(|t| **t > 0.0).sum();
        (b, total)
    }
}

fn resolve_rows(
    genes: &GeneSet,
    index: &std::collections::HashMap<&str, usize>,
    matrix: GeneSource,
) -> Result<Vec<usize>, DeconvError> {
    genes
        .genes()
        .iter()
        .map(|gene| {
            index
                .get(gene.as_str())
                .copied()
                .ok_or_else(|| DeconvError::MissingGene {
                    gene: gene.clone(),
                    matrix,
                })
        })
        .collect()
}
