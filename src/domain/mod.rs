//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - sweep identity (`Direction`, `SpatialFitKey`)
//! - fit window and status (`BiasWindow`, `FitStatus`)
//! - aggregation and execution knobs (`Combine`, `Smoothing`, `PassMode`, `Parallelism`)
//! - run configuration (`FitConfig`, `InitialGuess`)

pub mod types;

pub use types::*;
