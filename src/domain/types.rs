//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - frozen to JSON together with a grid
//! - exported to CSV for downstream plotting

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::models::Backend;

/// Direction of a bias sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }

    /// Numeric code used in CSV exports (`fwd=0, bwd=1`).
    pub fn code(self) -> u8 {
        match self {
            Direction::Forward => 0,
            Direction::Backward => 1,
        }
    }
}

/// Identity of a sweep and of the `PointFit` that aggregates it.
///
/// Field order is the comparison order: x, y, pass, sweep number, direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpatialFitKey {
    pub x_index: usize,
    pub y_index: usize,
    pub pass_number: u32,
    pub sweep_number: u32,
    pub direction: Direction,
}

impl SpatialFitKey {
    /// Same acquisition, opposite sweep direction.
    pub fn reversed(self) -> Self {
        Self {
            direction: self.direction.reversed(),
            ..self
        }
    }

    pub fn next_sweep(self) -> Self {
        Self {
            sweep_number: self.sweep_number + 1,
            ..self
        }
    }

    pub fn previous_sweep(self) -> Option<Self> {
        let sweep_number = self.sweep_number.checked_sub(1)?;
        Some(Self {
            sweep_number,
            ..self
        })
    }

    /// Another sweep taken at the same grid position.
    pub fn with_sweep(self, sweep_number: u32, direction: Direction, pass_number: u32) -> Self {
        Self {
            sweep_number,
            direction,
            pass_number,
            ..self
        }
    }
}

impl std::fmt::Display for SpatialFitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:03}_{:03}_{:03}_{:03}_{:02}",
            self.x_index,
            self.y_index,
            self.pass_number,
            self.sweep_number,
            self.direction.code()
        )
    }
}

/// Closed bias interval `[min, max]` used as the fit window.
///
/// Invariant: `min < max`, both finite. Only `BiasWindow::new` builds one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiasWindow {
    min: f64,
    max: f64,
}

impl BiasWindow {
    pub fn new(min: f64, max: f64) -> Option<Self> {
        if min.is_finite() && max.is_finite() && min < max {
            Some(Self { min, max })
        } else {
            None
        }
    }

    /// Full extent of a bias series (`None` for empty, constant or non-finite data).
    pub fn spanning(bias: &[f64]) -> Option<Self> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in bias {
            if v.is_finite() {
                min = min.min(v);
                max = max.max(v);
            }
        }
        Self::new(min, max)
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    /// Intersection with `other`, if it is still a valid window.
    pub fn clamp_to(&self, other: &BiasWindow) -> Option<Self> {
        Self::new(self.min.max(other.min), self.max.min(other.max))
    }
}

/// Outcome category of the last fit applied to a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitStatus {
    #[default]
    Unfitted,
    /// Auto-range search met its tolerance (or a plain fit succeeded).
    Converged,
    /// Search ran out of iterations but the estimate passed the sanity gate.
    Exhausted,
    /// Plain fit failed numerically.
    Failed,
    /// Estimate discarded because its relative error was too large.
    Downgraded,
}

impl FitStatus {
    pub fn display_name(self) -> &'static str {
        match self {
            FitStatus::Unfitted => "unfitted",
            FitStatus::Converged => "converged",
            FitStatus::Exhausted => "exhausted",
            FitStatus::Failed => "failed",
            FitStatus::Downgraded => "downgraded",
        }
    }
}

/// How repeated sweeps of one point are combined into a single series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    /// Element-wise mean.
    #[default]
    Mean,
    /// Element-wise median (robust to a single glitched sweep).
    Median,
}

/// Optional smoothing applied after combining sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Smoothing {
    #[default]
    None,
    /// Centered moving average; the window shrinks at the edges.
    MovingAverage(usize),
}

/// How repeat passes over the same position are numbered at grid construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PassMode {
    /// Number repeats 1..k by acquisition time; each pass is its own point.
    #[default]
    Chronological,
    /// Give every repeat pass 1 so they are averaged into one point.
    Merged,
}

/// Execution mode for batch fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    #[default]
    Sequential,
    /// Dedicated worker pool with this many threads.
    Threads(usize),
    /// Ambient rayon pool (one worker per CPU).
    Auto,
}

impl Parallelism {
    /// Parse `1`, `auto`, `-1` or a positive thread count.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "auto" | "-1" => Some(Parallelism::Auto),
            "1" | "0" | "seq" | "sequential" => Some(Parallelism::Sequential),
            other => other.parse::<usize>().ok().map(Parallelism::Threads),
        }
    }
}

/// Starting point of a fit: noise offset plus one `(φ, a)` pair per barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialGuess {
    pub noise: f64,
    pub barrier_heights: Vec<f64>,
    pub trans_coefficients: Vec<f64>,
}

impl Default for InitialGuess {
    fn default() -> Self {
        Self {
            noise: 1e-9,
            barrier_heights: vec![-0.8],
            trans_coefficients: vec![0.001],
        }
    }
}

impl InitialGuess {
    pub fn barrier_count(&self) -> usize {
        self.barrier_heights.len()
    }

    /// Pack into the `[offset, φ.., a..]` layout used by the emission model.
    pub fn to_params(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(1 + 2 * self.barrier_count());
        out.push(self.noise);
        out.extend_from_slice(&self.barrier_heights);
        out.extend_from_slice(&self.trans_coefficients);
        out
    }
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags, `.env` and defaults.
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub grid_path: PathBuf,
    pub output_path: Option<PathBuf>,
    pub export_dir: Option<PathBuf>,
    pub export_all: bool,

    pub backend: Backend,
    pub parallelism: Parallelism,

    /// Emission exponent `n` applied to every point.
    pub order: f64,
    pub auto_range: bool,
    pub margin: f64,
    pub tol: f64,
    pub max_iterations: usize,
    pub conv_ratio: f64,
    pub max_evaluations: usize,
    pub guess: InitialGuess,

    pub pass_mode: PassMode,
    pub combine: Combine,
    pub smoothing: Smoothing,

    /// r² threshold for "good" points.
    pub r_squared_min: f64,
    pub top_n: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: usize, y: usize, pass: u32, sweep: u32, direction: Direction) -> SpatialFitKey {
        SpatialFitKey {
            x_index: x,
            y_index: y,
            pass_number: pass,
            sweep_number: sweep,
            direction,
        }
    }

    #[test]
    fn keys_order_by_x_then_y_then_pass_sweep_direction() {
        let mut keys = vec![
            key(1, 0, 1, 0, Direction::Forward),
            key(0, 1, 1, 0, Direction::Forward),
            key(0, 0, 2, 0, Direction::Forward),
            key(0, 0, 1, 1, Direction::Forward),
            key(0, 0, 1, 0, Direction::Backward),
            key(0, 0, 1, 0, Direction::Forward),
        ];
        keys.sort();
        assert_eq!(keys[0], key(0, 0, 1, 0, Direction::Forward));
        assert_eq!(keys[1], key(0, 0, 1, 0, Direction::Backward));
        assert_eq!(keys[2], key(0, 0, 1, 1, Direction::Forward));
        assert_eq!(keys[3], key(0, 0, 2, 0, Direction::Forward));
        assert_eq!(keys[4], key(0, 1, 1, 0, Direction::Forward));
        assert_eq!(keys[5], key(1, 0, 1, 0, Direction::Forward));
    }

    #[test]
    fn derived_keys() {
        let k = key(3, 4, 1, 0, Direction::Forward);
        assert_eq!(k.reversed().direction, Direction::Backward);
        assert_eq!(k.reversed().reversed(), k);
        assert_eq!(k.next_sweep().sweep_number, 1);
        assert!(k.previous_sweep().is_none());
        assert_eq!(k.next_sweep().previous_sweep(), Some(k));
        assert_eq!(k.to_string(), "003_004_001_000_00");
    }

    #[test]
    fn bias_window_rejects_empty_interval() {
        assert!(BiasWindow::new(0.0, 0.0).is_none());
        assert!(BiasWindow::new(1.0, -1.0).is_none());
        assert!(BiasWindow::new(f64::NAN, 1.0).is_none());
        let w = BiasWindow::spanning(&[-2.0, -1.0, f64::NAN, 0.5]).unwrap();
        assert_eq!((w.min(), w.max()), (-2.0, 0.5));
        assert!(BiasWindow::spanning(&[1.0, 1.0]).is_none());
    }

    #[test]
    fn parallelism_parse() {
        assert_eq!(Parallelism::parse("auto"), Some(Parallelism::Auto));
        assert_eq!(Parallelism::parse("-1"), Some(Parallelism::Auto));
        assert_eq!(Parallelism::parse("1"), Some(Parallelism::Sequential));
        assert_eq!(Parallelism::parse("4"), Some(Parallelism::Threads(4)));
        assert_eq!(Parallelism::parse("four"), None);
    }

    #[test]
    fn initial_guess_layout() {
        let guess = InitialGuess {
            noise: 1e-9,
            barrier_heights: vec![-0.8, -1.2],
            trans_coefficients: vec![1e-3, 2e-3],
        };
        assert_eq!(guess.to_params(), vec![1e-9, -0.8, -1.2, 1e-3, 2e-3]);
    }
}
