//! Measurement data and its grid organization.
//!
//! - single sweeps (`sweep`)
//! - per-point aggregation and fit state (`point_fit`)
//! - the indexed grid and batch fitting (`grid`)
//! - deterministic synthetic scans (`synth`)

pub mod grid;
pub mod point_fit;
pub mod sweep;
pub mod synth;

pub use grid::*;
pub use point_fit::*;
pub use sweep::*;
pub use synth::*;
