//! Mathematical utilities: Levenberg-Marquardt, covariance, statistics.

pub mod covariance;
pub mod lm;
pub mod stats;

pub use covariance::*;
pub use lm::*;
pub use stats::*;
