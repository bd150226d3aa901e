//! Shared "fit pipeline" logic used by the CLI subcommands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! load sweeps -> build grid -> fit all points -> save -> export
//!
//! The CLI can then focus on presentation.

use std::path::Path;

use crate::data::{Grid, GridFitSummary, GridOptions, SynthOptions, generate_grid};
use crate::domain::FitConfig;
use crate::error::AppError;
use crate::fit::SearchOptions;
use crate::io::{ExportSelection, read_snapshot, write_grid_csv, write_grid_json};
use crate::math::LmOptions;
use crate::models::EmissionModel;

/// All computed outputs of a single `beem fit` run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub grid: Grid,
    pub summary: GridFitSummary,
    /// Points written by the CSV export, if one was requested.
    pub exported: Option<usize>,
}

/// Generate a synthetic grid and save it unfitted.
pub fn run_synth(options: &SynthOptions, out: &Path) -> Result<usize, AppError> {
    let sweeps = generate_grid(options)?;
    let n = sweeps.len();
    let grid = Grid::new(sweeps, &GridOptions::default())?;
    write_grid_json(out, &grid)?;
    tracing::info!(sweeps = n, points = grid.len(), path = %out.display(), "synthetic grid written");
    Ok(n)
}

/// Execute the full fitting pipeline and return the computed outputs.
///
/// The grid is rebuilt from the file's sweeps with this run's settings, so
/// any fit state stored in the file is replaced.
pub fn run_fit(config: &FitConfig) -> Result<RunOutput, AppError> {
    // 1) Load sweeps.
    let snapshot = read_snapshot(&config.grid_path)?;

    // 2) Build the grid.
    let mut grid = Grid::new(snapshot.sweeps, &grid_options(config))?;
    tracing::info!(
        points = grid.len(),
        num_x = grid.num_x(),
        num_y = grid.num_y(),
        path = %config.grid_path.display(),
        "grid loaded"
    );

    // 3) Fit.
    let summary = grid.fit_all(config.parallelism, &search_options(config))?;

    // 4) Save and export.
    if let Some(path) = &config.output_path {
        write_grid_json(path, &grid)?;
    }
    let exported = match &config.export_dir {
        Some(dir) => {
            let selection = if config.export_all {
                ExportSelection::All
            } else {
                ExportSelection::Good(config.r_squared_min)
            };
            Some(write_grid_csv(dir, &grid, selection)?)
        }
        None => None,
    };

    Ok(RunOutput {
        grid,
        summary,
        exported,
    })
}

pub fn grid_options(config: &FitConfig) -> GridOptions {
    GridOptions {
        pass_mode: config.pass_mode,
        model: EmissionModel::new(config.backend),
        order: config.order,
        combine: config.combine,
        smoothing: config.smoothing,
        guess: config.guess.clone(),
        auto_range: config.auto_range,
    }
}

pub fn search_options(config: &FitConfig) -> SearchOptions {
    SearchOptions {
        margin: config.margin,
        tol: config.tol,
        max_iterations: config.max_iterations,
        conv_ratio: config.conv_ratio,
        lm: LmOptions {
            max_evaluations: config.max_evaluations,
            ..LmOptions::default()
        },
        ..SearchOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Combine, InitialGuess, Parallelism, PassMode, Smoothing};
    use crate::domain::FitStatus;
    use crate::models::Backend;

    fn config(grid_path: &Path, dir: &Path) -> FitConfig {
        FitConfig {
            grid_path: grid_path.to_path_buf(),
            output_path: Some(dir.join("fitted.json")),
            export_dir: Some(dir.join("csv")),
            export_all: true,
            backend: Backend::Fast,
            parallelism: Parallelism::Threads(2),
            order: 2.0,
            auto_range: true,
            margin: 0.4,
            tol: 0.001,
            max_iterations: 10,
            conv_ratio: 1.0,
            max_evaluations: 2000,
            guess: InitialGuess::default(),
            pass_mode: PassMode::Chronological,
            combine: Combine::Mean,
            smoothing: Smoothing::None,
            r_squared_min: 0.6,
            top_n: 5,
        }
    }

    #[test]
    fn synth_then_fit_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let grid_path = dir.path().join("grid.json");
        let options = SynthOptions {
            nx: 3,
            ny: 2,
            ..SynthOptions::default()
        };
        assert_eq!(run_synth(&options, &grid_path).unwrap(), 6);

        let config = config(&grid_path, dir.path());
        let run = run_fit(&config).unwrap();
        assert_eq!(run.summary.total, 6);
        assert_eq!(run.summary.unfitted, 0);
        assert_eq!(run.exported, Some(6));
        assert!(dir.path().join("csv").join("grid.csv").exists());

        let saved = crate::io::read_grid_json(&dir.path().join("fitted.json")).unwrap();
        assert_eq!(saved.summary(), run.summary);
        assert!(saved.points().iter().all(|p| p.status() != FitStatus::Unfitted));
        assert_eq!(saved.points()[0].model().backend(), Backend::Fast);
    }

    #[test]
    fn missing_grid_is_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir.path().join("nope.json"), dir.path());
        assert_eq!(run_fit(&config).unwrap_err().exit_code(), 2);
    }
}
