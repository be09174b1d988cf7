//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - validated inputs (`ReferenceProfile`, `SpatialDataset`, `GeneSet`, `ClassMapping`)
//! - run configuration (`DeconvConfig`, `SolveMode`, `Constraint`)
//! - per-location outputs (`WeightFit`, `DoubletRecord`, `SpotClass`)

pub mod types;

pub use types::*;
