//! Numerical building blocks: grids, quadrature rules, least squares and QP.

pub mod grid;
pub mod hermite;
pub mod ols;
pub mod qp;

pub use grid::*;
pub use hermite::*;
pub use ols::*;
pub use qp::*;
