//! Count-noise model and mixture evaluation.

pub mod mixture;
pub mod quadrature;

pub use mixture::*;
pub use quadrature::*;
