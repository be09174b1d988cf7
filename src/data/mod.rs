//! Synthetic data for the `simulate` command and for tests.

pub mod sample;

pub use sample::*;
