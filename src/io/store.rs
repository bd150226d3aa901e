//! Freeze and thaw a fitted grid as JSON.
//!
//! The snapshot stores every sweep once, in grid order, and the per-point
//! fit state by reference to those sweeps. Thawing rebuilds the grid from the
//! sweeps and replays each point's state through `PointFit::apply`, so a
//! loaded grid obeys the same invariants as a freshly fitted one.
//!
//! JSON has no infinity: standard errors are written as `null` when unknown.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{Grid, GridOptions, Sweep};
use crate::domain::{BiasWindow, Combine, FitStatus, InitialGuess, PassMode, Smoothing, SpatialFitKey};
use crate::error::{AppError, FitError};
use crate::fit::{FitOutcome, PointEstimate};
use crate::models::{Backend, EmissionModel};

pub const SNAPSHOT_FORMAT: &str = "beem-grid";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub format: String,
    pub version: u32,
    pub saved_at: NaiveDateTime,
    pub pass_mode: PassMode,
    pub sweeps: Vec<Sweep>,
    pub points: Vec<PointState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointState {
    pub key: SpatialFitKey,
    /// Positions in `GridSnapshot::sweeps`.
    pub sweep_indices: Vec<usize>,
    pub backend: Backend,
    pub order: f64,
    pub combine: Combine,
    pub smoothing: Smoothing,
    pub guess: InitialGuess,
    pub auto_range: bool,
    pub window: BiasWindow,
    pub status: FitStatus,
    pub iterations: usize,
    /// `[offset, φ.., a..]` of the estimate, if any.
    pub params: Option<Vec<f64>>,
    /// Standard errors matching `params`; `None` entries are unknown.
    pub errors: Option<Vec<Option<f64>>>,
    pub failure: Option<FitError>,
}

/// Capture the full state of `grid`.
pub fn freeze(grid: &Grid) -> GridSnapshot {
    let sweeps = grid.sweeps().iter().map(|s| Sweep::clone(s)).collect();
    let points = grid
        .points()
        .iter()
        .map(|p| {
            let estimate = p.estimate();
            PointState {
                key: p.key(),
                sweep_indices: grid.sweep_indices(&p.key()).to_vec(),
                backend: p.model().backend(),
                order: p.order(),
                combine: p.combine(),
                smoothing: p.smoothing(),
                guess: p.guess().clone(),
                auto_range: p.auto_range(),
                window: p.window(),
                status: p.status(),
                iterations: p.iterations(),
                params: estimate.map(PointEstimate::to_params),
                errors: estimate.map(|e| {
                    std::iter::once(e.noise_offset_err)
                        .chain(e.barrier_height_errs.iter().copied())
                        .chain(e.trans_coefficient_errs.iter().copied())
                        .map(|v| v.is_finite().then_some(v))
                        .collect()
                }),
                failure: p.failure().cloned(),
            }
        })
        .collect();

    GridSnapshot {
        format: SNAPSHOT_FORMAT.to_string(),
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now().naive_utc(),
        pass_mode: grid.pass_mode(),
        sweeps,
        points,
    }
}

fn check_format(snapshot: &GridSnapshot) -> Result<(), AppError> {
    if snapshot.format != SNAPSHOT_FORMAT || snapshot.version != SNAPSHOT_VERSION {
        return Err(AppError::new(
            2,
            format!(
                "Unsupported grid snapshot '{}' v{} (expected '{SNAPSHOT_FORMAT}' v{SNAPSHOT_VERSION}).",
                snapshot.format, snapshot.version
            ),
        ));
    }
    Ok(())
}

/// Rebuild a grid from a snapshot.
pub fn thaw(snapshot: GridSnapshot) -> Result<Grid, AppError> {
    check_format(&snapshot)?;

    let options = GridOptions {
        pass_mode: snapshot.pass_mode,
        ..GridOptions::default()
    };
    let mut grid = Grid::new(snapshot.sweeps, &options)?;

    for state in snapshot.points {
        if grid.sweep_indices(&state.key) != state.sweep_indices.as_slice() {
            return Err(AppError::new(
                2,
                format!("Grid snapshot is inconsistent: sweeps of point {} moved.", state.key),
            ));
        }
        let outcome = outcome_from_state(&state)?;
        let point = grid
            .point_mut(&state.key)
            .ok_or_else(|| AppError::new(2, format!("Grid snapshot names unknown point {}.", state.key)))?;

        point.set_model(EmissionModel::new(state.backend));
        point.set_order(state.order);
        point.set_combine(state.combine);
        point.set_smoothing(state.smoothing);
        point.set_guess(state.guess);
        point.set_auto_range(state.auto_range);
        point
            .set_window(state.window.min(), state.window.max())
            .map_err(|e| AppError::new(2, format!("Point {}: {e}", state.key)))?;
        if let Some(outcome) = outcome {
            point.apply(outcome);
        }
    }

    Ok(grid)
}

fn outcome_from_state(state: &PointState) -> Result<Option<FitOutcome>, AppError> {
    let window = state.window;
    let outcome = match state.status {
        FitStatus::Unfitted => None,
        FitStatus::Converged | FitStatus::Exhausted => {
            let params = state.params.as_deref().unwrap_or_default();
            let errors: Vec<f64> = state
                .errors
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|e| e.unwrap_or(f64::INFINITY))
                .collect();
            let estimate = PointEstimate::from_params(params, &errors)
                .ok_or_else(|| AppError::new(2, format!("Point {} has a malformed estimate.", state.key)))?;
            Some(FitOutcome::Converged {
                estimate,
                window,
                iterations: state.iterations,
                within_tolerance: state.status == FitStatus::Converged,
            })
        }
        FitStatus::Failed => Some(FitOutcome::Failed {
            reason: state.failure.clone().unwrap_or(FitError::EmptySample),
            window,
        }),
        FitStatus::Downgraded => Some(FitOutcome::Downgraded {
            window,
            iterations: state.iterations,
        }),
    };
    Ok(outcome)
}

/// Write a grid snapshot file.
pub fn write_grid_json(path: &Path, grid: &Grid) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create grid JSON '{}': {e}", path.display())))?;
    serde_json::to_writer(BufWriter::new(file), &freeze(grid))
        .map_err(|e| AppError::new(2, format!("Failed to write grid JSON: {e}")))?;
    Ok(())
}

/// Read a snapshot file without rebuilding the grid.
///
/// Used when only the sweeps matter, e.g. before refitting with new settings.
pub fn read_snapshot(path: &Path) -> Result<GridSnapshot, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open grid JSON '{}': {e}", path.display())))?;
    let snapshot: GridSnapshot = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::new(2, format!("Invalid grid JSON: {e}")))?;
    check_format(&snapshot)?;
    Ok(snapshot)
}

/// Read a grid snapshot file.
pub fn read_grid_json(path: &Path) -> Result<Grid, AppError> {
    thaw(read_snapshot(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SynthOptions, generate_grid};
    use crate::domain::Parallelism;
    use crate::fit::SearchOptions;

    fn fitted_grid() -> Grid {
        let sweeps = generate_grid(&SynthOptions {
            nx: 2,
            ny: 2,
            dead_fraction: 0.25,
            ..SynthOptions::default()
        })
        .unwrap();
        let mut grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        grid.fit_all(Parallelism::Sequential, &SearchOptions::default()).unwrap();
        grid
    }

    #[test]
    fn grid_survives_a_file_roundtrip() {
        let grid = fitted_grid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.json");

        write_grid_json(&path, &grid).unwrap();
        let loaded = read_grid_json(&path).unwrap();

        assert_eq!(loaded.len(), grid.len());
        assert_eq!(loaded.summary(), grid.summary());
        for (a, b) in grid.points().iter().zip(loaded.points()) {
            assert_eq!(a.key(), b.key());
            assert_eq!(a.status(), b.status());
            assert_eq!(a.window(), b.window());
            assert_eq!(a.barrier_heights(), b.barrier_heights());
            assert_eq!(a.r_squared(), b.r_squared());
        }
    }

    #[test]
    fn unknown_errors_are_written_as_null() {
        let grid = fitted_grid();
        let mut snapshot = freeze(&grid);
        let state = snapshot
            .points
            .iter_mut()
            .find(|p| p.params.is_some())
            .expect("at least one fitted point");
        state.errors = Some(vec![None; state.params.as_ref().unwrap().len()]);
        let key = state.key;

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: GridSnapshot = serde_json::from_str(&json).unwrap();
        let grid = thaw(back).unwrap();
        let point = grid.point(&key).unwrap();
        assert!(point.barrier_height_errs().iter().all(|e| e.is_infinite()));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.json");
        std::fs::write(&path, "{\"hello\": 1}").unwrap();
        assert_eq!(read_grid_json(&path).unwrap_err().exit_code(), 2);
        assert_eq!(read_grid_json(&dir.path().join("missing.json")).unwrap_err().exit_code(), 2);
    }
}
