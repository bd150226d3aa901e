//! Fitting the emission model to one point.
//!
//! Responsibilities:
//!
//! - run a single Levenberg-Marquardt attempt and extract its covariance
//! - search for the bias window around the primary barrier
//! - report the result as a typed `FitOutcome`
//! - fit macroscopic Schottky diode I-V curves (`iv`)

pub mod auto_range;
pub mod curve_fit;
pub mod iv;
pub mod outcome;

pub use auto_range::*;
pub use curve_fit::*;
pub use iv::*;
pub use outcome::*;
