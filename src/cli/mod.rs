//! Command-line parsing for the BEEM spectroscopy fitter.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/math code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{Combine, PassMode};
use crate::models::Backend;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "beem", version, about = "BEEM spectroscopy grid fitter")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a synthetic grid and write it as grid JSON.
    Synth(SynthArgs),
    /// Fit every point of a grid, print a summary, optionally save/export.
    Fit(FitArgs),
    /// Print the summary of a saved grid without refitting.
    Show(ShowArgs),
}

/// Options for synthetic grid generation.
#[derive(Debug, Parser, Clone)]
pub struct SynthArgs {
    /// Output grid JSON.
    #[arg(short = 'o', long, value_name = "JSON")]
    pub out: PathBuf,

    /// Positions along x.
    #[arg(long, default_value_t = 8)]
    pub nx: usize,

    /// Positions along y.
    #[arg(long, default_value_t = 8)]
    pub ny: usize,

    /// Grid pitch (nm).
    #[arg(long, default_value_t = 5.0)]
    pub step: f64,

    /// Sweeps recorded per position and pass.
    #[arg(long, default_value_t = 1)]
    pub sweeps: u32,

    /// Repeat passes over the whole grid.
    #[arg(long, default_value_t = 1)]
    pub passes: u32,

    /// Record the backward sweep too.
    #[arg(long)]
    pub both_directions: bool,

    /// Samples per sweep.
    #[arg(long, default_value_t = 160)]
    pub samples: usize,

    #[arg(long, default_value_t = -2.0, allow_hyphen_values = true)]
    pub bias_min: f64,

    #[arg(long, default_value_t = -0.05, allow_hyphen_values = true)]
    pub bias_max: f64,

    /// Mean barrier height (V).
    #[arg(long, default_value_t = -0.8, allow_hyphen_values = true)]
    pub barrier: f64,

    /// Barrier height spread across the grid (V).
    #[arg(long, default_value_t = 0.03)]
    pub spread: f64,

    /// Transmission coefficient.
    #[arg(long, default_value_t = 1e-3)]
    pub trans: f64,

    /// BEEM current noise (standard deviation).
    #[arg(long, default_value_t = 2e-7)]
    pub noise_sigma: f64,

    /// Fraction of positions without signal.
    #[arg(long, default_value_t = 0.05)]
    pub dead_fraction: f64,

    /// Random seed.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

/// Options for fitting a grid.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Grid JSON produced by `beem synth` or a previous `beem fit`.
    #[arg(value_name = "GRID")]
    pub grid: PathBuf,

    /// Save the fitted grid as JSON.
    #[arg(short = 'o', long, value_name = "JSON")]
    pub out: Option<PathBuf>,

    /// Export CSV files (grid.csv + one file per point) into this folder.
    #[arg(long, value_name = "DIR")]
    pub export: Option<PathBuf>,

    /// Export every point instead of only the good ones.
    #[arg(long)]
    pub export_all: bool,

    /// Model evaluation backend (default from BEEM_BACKEND, else reference).
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Worker threads: `1` sequential, `auto`/`-1` all CPUs, or a count
    /// (default from BEEM_THREADS, else sequential).
    #[arg(long, allow_hyphen_values = true)]
    pub threads: Option<String>,

    /// Emission exponent n.
    #[arg(short = 'n', long, default_value_t = 2.0)]
    pub order: f64,

    /// Fit the whole window once instead of searching for it.
    #[arg(long)]
    pub no_auto_range: bool,

    /// Distance between barrier and window edge (V).
    #[arg(long, default_value_t = 0.4)]
    pub margin: f64,

    /// Barrier change considered converged (V).
    #[arg(long, default_value_t = 0.001)]
    pub tol: f64,

    /// Maximum window-search iterations.
    #[arg(long, default_value_t = 10)]
    pub max_iterations: usize,

    /// Weight of the new barrier estimate when moving the window.
    #[arg(long, default_value_t = 1.0)]
    pub conv_ratio: f64,

    /// Residual evaluations allowed per least-squares fit.
    #[arg(long, default_value_t = 2000)]
    pub max_evaluations: usize,

    /// Initial barrier height(s); repeat for several barriers.
    #[arg(long = "barrier", default_values_t = [-0.8], allow_hyphen_values = true)]
    pub barriers: Vec<f64>,

    /// Initial transmission coefficient(s), one per barrier.
    #[arg(long = "trans", default_values_t = [0.001])]
    pub trans: Vec<f64>,

    /// Initial noise offset.
    #[arg(long, default_value_t = 1e-9, allow_hyphen_values = true)]
    pub noise: f64,

    /// How repeated sweeps of a point are combined.
    #[arg(long, value_enum, default_value_t = Combine::Mean)]
    pub combine: Combine,

    /// Moving-average width applied after combining (0 = off).
    #[arg(long, default_value_t = 0)]
    pub smooth: usize,

    /// How repeat passes are numbered.
    #[arg(long, value_enum, default_value_t = PassMode::Chronological)]
    pub pass_mode: PassMode,

    /// r² threshold for good points.
    #[arg(long = "r2-min", default_value_t = 0.6)]
    pub r_squared_min: f64,

    /// Rows in the best-points table.
    #[arg(long, default_value_t = 10)]
    pub top: usize,
}

/// Options for showing a saved grid.
#[derive(Debug, Parser, Clone)]
pub struct ShowArgs {
    /// Grid JSON.
    #[arg(value_name = "GRID")]
    pub grid: PathBuf,

    /// r² threshold for good points.
    #[arg(long = "r2-min", default_value_t = 0.6)]
    pub r_squared_min: f64,

    /// Rows in the best-points table.
    #[arg(long, default_value_t = 10)]
    pub top: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fit_with_several_barriers() {
        let cli = Cli::try_parse_from([
            "beem", "fit", "grid.json", "--barrier", "-0.8", "--barrier", "-1.2", "--trans", "1e-3", "--trans",
            "2e-3", "--threads", "-1", "--backend", "fast",
        ])
        .unwrap();
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.barriers, vec![-0.8, -1.2]);
        assert_eq!(args.trans, vec![1e-3, 2e-3]);
        assert_eq!(args.threads.as_deref(), Some("-1"));
        assert_eq!(args.backend, Some(Backend::Fast));
        assert_eq!(args.pass_mode, PassMode::Chronological);
    }

    #[test]
    fn fit_defaults() {
        let cli = Cli::try_parse_from(["beem", "fit", "g.json"]).unwrap();
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.barriers, vec![-0.8]);
        assert_eq!(args.order, 2.0);
        assert!(!args.no_auto_range);
        assert!(args.threads.is_none());
    }

    #[test]
    fn synth_requires_output() {
        assert!(Cli::try_parse_from(["beem", "synth"]).is_err());
        assert!(Cli::try_parse_from(["beem", "synth", "-o", "g.json", "--barrier", "-0.7"]).is_ok());
    }
}
