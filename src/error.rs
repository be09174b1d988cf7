//! Error types.
//!
//! Three layers:
//!
//! - `DeconvError`: structural problems (shape mismatches, missing genes, bad
//!   configuration). These abort a run before any location is solved.
//! - `LocationFailure`: a numerical anomaly confined to one location. These are
//!   stored alongside the results and never abort a batch.
//! - `AppError`: the CLI boundary, carrying a process exit code.

use thiserror::Error;

/// Which input matrix a gene was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneSource {
    Reference,
    Spatial,
}

impl std::fmt::Display for GeneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneSource::Reference => write!(f, "reference profile"),
            GeneSource::Spatial => write!(f, "spatial dataset"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeconvError {
    #[error("Gene '{gene}' from the gene set is absent from the {matrix}.")]
    MissingGene { gene: String, matrix: GeneSource },

    #[error("The gene set is empty.")]
    EmptyGeneSet,

    #[error("The reference profile has no cell types.")]
    NoCellTypes,

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid quadrature table: {0}")]
    InvalidQuadrature(String),

    #[error("Invalid input data: {0}")]
    InvalidData(String),

    #[error("I/O error on '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Parse error in '{path}' line {line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },
}

impl DeconvError {
    /// Exit code used when this error reaches the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            DeconvError::InvalidConfig(_) | DeconvError::Io { .. } | DeconvError::Parse { .. } => 2,
            DeconvError::MissingGene { .. }
            | DeconvError::EmptyGeneSet
            | DeconvError::NoCellTypes
            | DeconvError::ShapeMismatch(_)
            | DeconvError::InvalidData(_) => 3,
            DeconvError::InvalidQuadrature(_) => 4,
        }
    }
}

/// Reasons the quadratic-program step could not produce weights.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFault {
    #[error("no feasible point for the constraint set")]
    InfeasibleConstraint,
    #[error("KKT system is singular")]
    SingularSystem,
    #[error("non-finite values in the weighted system")]
    NonFinite,
}

/// A per-location failure. The batch records it and moves on.
///
/// Solver faults do not appear here: they become `FitStatus::Fallback`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationFailure {
    #[error("total count {total} is not positive")]
    EmptyLocation { total: f64 },
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<DeconvError> for AppError {
    fn from(value: DeconvError) -> Self {
        AppError::new(value.exit_code(), value.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
