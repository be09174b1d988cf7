//! Reporting utilities: terminal summaries of batch results.

pub mod format;

pub use format::*;
