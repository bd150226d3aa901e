//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and installs logging
//! - parses CLI arguments
//! - builds the run configuration
//! - dispatches to the pipeline and prints reports

use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Command, FitArgs, ShowArgs, SynthArgs};
use crate::data::SynthOptions;
use crate::domain::{FitConfig, InitialGuess, Parallelism, Smoothing};
use crate::error::AppError;
use crate::models::Backend;

pub mod pipeline;

/// Entry point for the `beem` binary.
pub fn run() -> Result<(), AppError> {
    init_tracing(startup_filter(None));

    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Synth(args) => handle_synth(args),
        Command::Fit(args) => handle_fit(args),
        Command::Show(args) => handle_show(args),
    }
}

/// Load `.env` (or `env_file`), then build the log filter from `RUST_LOG`.
///
/// The file is read first so a `RUST_LOG` set there takes effect.
fn startup_filter(env_file: Option<&Path>) -> EnvFilter {
    let _ = match env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(filter: EnvFilter) {
    // A second install (tests, embedding) is not an error worth reporting.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_synth(args: SynthArgs) -> Result<(), AppError> {
    let options = synth_options_from_args(&args);
    let n = pipeline::run_synth(&options, &args.out)?;
    println!("Wrote {n} sweeps to {}", args.out.display());
    Ok(())
}

fn handle_fit(args: FitArgs) -> Result<(), AppError> {
    let config = fit_config_from_args(&args)?;
    let run = pipeline::run_fit(&config)?;

    println!(
        "{}",
        crate::report::format_run_summary(&run.grid, &run.summary, config.r_squared_min)
    );
    println!("{}", crate::report::format_point_table(run.grid.points(), config.top_n));
    if let Some(n) = run.exported {
        if let Some(dir) = &config.export_dir {
            println!("Exported {n} points to {}", dir.display());
        }
    }
    Ok(())
}

fn handle_show(args: ShowArgs) -> Result<(), AppError> {
    let grid = crate::io::read_grid_json(&args.grid)?;
    let summary = grid.summary();
    println!(
        "{}",
        crate::report::format_run_summary(&grid, &summary, args.r_squared_min)
    );
    println!("{}", crate::report::format_point_table(grid.points(), args.top));
    Ok(())
}

pub fn synth_options_from_args(args: &SynthArgs) -> SynthOptions {
    SynthOptions {
        nx: args.nx,
        ny: args.ny,
        step: args.step,
        sweeps_per_point: args.sweeps,
        passes: args.passes,
        both_directions: args.both_directions,
        samples: args.samples,
        bias_min: args.bias_min,
        bias_max: args.bias_max,
        barrier_mean: args.barrier,
        barrier_spread: args.spread,
        trans_coefficient: args.trans,
        noise_sigma: args.noise_sigma,
        dead_fraction: args.dead_fraction,
        seed: args.seed,
        ..SynthOptions::default()
    }
}

/// Merge CLI flags with `BEEM_THREADS` / `BEEM_BACKEND` and validate.
///
/// Flags win over the environment; the environment wins over defaults.
pub fn fit_config_from_args(args: &FitArgs) -> Result<FitConfig, AppError> {
    let threads = args
        .threads
        .clone()
        .or_else(|| std::env::var("BEEM_THREADS").ok());
    let parallelism = match threads {
        Some(value) => Parallelism::parse(&value)
            .ok_or_else(|| AppError::new(2, format!("Invalid thread setting '{value}'.")))?,
        None => Parallelism::Sequential,
    };

    let backend = match args.backend {
        Some(backend) => backend,
        None => match std::env::var("BEEM_BACKEND") {
            Ok(value) => Backend::parse(&value)
                .ok_or_else(|| AppError::new(2, format!("Invalid BEEM_BACKEND '{value}'.")))?,
            Err(_) => Backend::default(),
        },
    };

    if args.barriers.is_empty() || args.barriers.len() != args.trans.len() {
        return Err(AppError::new(
            2,
            format!(
                "Need one --trans per --barrier (got {} barrier(s), {} coefficient(s)).",
                args.barriers.len(),
                args.trans.len()
            ),
        ));
    }
    if !(args.order.is_finite() && args.order > 0.0) {
        return Err(AppError::new(2, "Emission order must be > 0."));
    }
    if !(args.margin.is_finite() && args.margin > 0.0) {
        return Err(AppError::new(2, "Margin must be > 0."));
    }
    if !(args.tol.is_finite() && args.tol > 0.0) {
        return Err(AppError::new(2, "Tolerance must be > 0."));
    }
    if !(args.conv_ratio.is_finite() && args.conv_ratio > 0.0 && args.conv_ratio <= 1.0) {
        return Err(AppError::new(2, "Convergence ratio must lie in (0, 1]."));
    }
    if args.max_iterations == 0 || args.max_evaluations == 0 {
        return Err(AppError::new(2, "Iteration and evaluation budgets must be > 0."));
    }

    Ok(FitConfig {
        grid_path: args.grid.clone(),
        output_path: args.out.clone(),
        export_dir: args.export.clone(),
        export_all: args.export_all,

        backend,
        parallelism,

        order: args.order,
        auto_range: !args.no_auto_range,
        margin: args.margin,
        tol: args.tol,
        max_iterations: args.max_iterations,
        conv_ratio: args.conv_ratio,
        max_evaluations: args.max_evaluations,
        guess: InitialGuess {
            noise: args.noise,
            barrier_heights: args.barriers.clone(),
            trans_coefficients: args.trans.clone(),
        },

        pass_mode: args.pass_mode,
        combine: args.combine,
        smoothing: match args.smooth {
            0 | 1 => Smoothing::None,
            width => Smoothing::MovingAverage(width),
        },

        r_squared_min: args.r_squared_min,
        top_n: args.top,
    })
}
