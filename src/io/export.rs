//! Export fitted grids to CSV.
//!
//! Layout of an export folder:
//! - `grid.csv`: one row per exported point (indices, offset, barrier, R, r²)
//! - `bees_NNNN.csv`: the point's series, with the fit over the window
//!
//! Both files start with a `[METADATA]` style header so they stay readable on
//! their own; data rows are `;`-separated.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::data::{Grid, PointFit};
use crate::error::AppError;

/// Which points go into an export.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExportSelection {
    All,
    /// Points with `threshold < r² < 1`.
    Good(f64),
}

/// Write `grid.csv` plus one CSV per selected point into `folder`.
///
/// Returns the number of exported points.
pub fn write_grid_csv(folder: &Path, grid: &Grid, selection: ExportSelection) -> Result<usize, AppError> {
    fs::create_dir_all(folder)
        .map_err(|e| AppError::new(4, format!("Failed to create export folder '{}': {e}", folder.display())))?;

    let points: Vec<&PointFit> = match selection {
        ExportSelection::All => grid.points().iter().collect(),
        ExportSelection::Good(threshold) => grid.extract_good(threshold),
    };

    let path = folder.join("grid.csv");
    let file = File::create(&path)
        .map_err(|e| AppError::new(4, format!("Failed to create export CSV '{}': {e}", path.display())))?;
    let mut out = BufWriter::new(file);
    let write_err = |e: std::io::Error| AppError::new(4, format!("Failed to write '{}': {e}", path.display()));

    let xs = grid.x_positions();
    let ys = grid.y_positions();
    let date = grid
        .points()
        .iter()
        .filter_map(PointFit::acquired_at)
        .min()
        .map(|d| d.to_string());
    writeln!(
        out,
        "GRID DATA\n[METADATA]\nposition x : {}\nposition y : {}\nsize x : {}\nsize y : {}\ndimension x : {}\ndimension y : {}\ndate : {}\n[DATA]",
        xs[0],
        ys[0],
        xs[xs.len() - 1] - xs[0],
        ys[ys.len() - 1] - ys[0],
        grid.num_x(),
        grid.num_y(),
        text(date),
    )
    .map_err(write_err)?;
    writeln!(
        out,
        "no;index x;index y;sweep;pass;direction (fwd=0, bwd=1);offset;barrier height;R;r squared"
    )
    .map_err(write_err)?;

    for (i, p) in points.iter().enumerate() {
        let k = p.key();
        writeln!(
            out,
            "{i};{};{};{};{};{};{};{};{};{}",
            k.x_index,
            k.y_index,
            k.sweep_number,
            k.pass_number,
            k.direction.code(),
            sci(p.noise_offset()),
            fixed(p.barrier_heights().map(|b| b[0])),
            fixed(p.trans_resistance().map(|r| r[0])),
            fixed(p.r_squared()),
        )
        .map_err(write_err)?;

        write_point_csv(&folder.join(format!("bees_{i:04}.csv")), p)?;
    }
    out.flush().map_err(write_err)?;

    Ok(points.len())
}

/// Write one point's metadata, fit result and series.
pub fn write_point_csv(path: &Path, point: &PointFit) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(4, format!("Failed to create export CSV '{}': {e}", path.display())))?;
    let mut out = BufWriter::new(file);
    let write_err = |e: std::io::Error| AppError::new(4, format!("Failed to write '{}': {e}", path.display()));

    let k = point.key();
    let estimate = point.estimate();
    writeln!(
        out,
        "BEES DATA\n[METADATA]\nposition x : {}\nposition y : {}\nindex x : {}\nindex y : {}\nsweep : {}\npass : {}\ndirection : {}\ndate : {}\n[FIT PARAMETER]\nmodel : Bell-Kaiser (V correction)\nbackend : {:?}\nn : {}\nstatus : {}\n[FITTED RESULT]\noffset : {}\nbarrier height : {}\nTransmission R : {}\noffset error : {}\nbarrier height error : {}\nTransmission R error : {}\nR squared : {}\n[DATA]",
        text(point.pos_x()),
        text(point.pos_y()),
        k.x_index,
        k.y_index,
        k.sweep_number,
        k.pass_number,
        k.direction.display_name(),
        text(point.acquired_at()),
        point.model().backend(),
        point.order(),
        point.status().display_name(),
        text(estimate.map(|e| e.noise_offset)),
        list(point.barrier_heights()),
        list(point.trans_resistance().as_deref()),
        text(estimate.map(|e| e.noise_offset_err)),
        list(estimate.map(|e| e.barrier_height_errs.as_slice())),
        list(point.trans_resistance_err().as_deref()),
        text(point.r_squared()),
    )
    .map_err(write_err)?;
    writeln!(out, "bias;i_beem;i_beem_fitted;i_tunnel;z").map_err(write_err)?;

    let bias = point.bias();
    let window = point.window();
    let mut fitted = point.i_beem_estimated().unwrap_or_default().into_iter();
    for (i, &v) in bias.iter().enumerate() {
        let estimated = if window.contains(v) { fitted.next() } else { None };
        writeln!(
            out,
            "{v:e};{};{};{};{}",
            sci(point.i_beem().map(|s| s[i])),
            sci(estimated),
            sci(point.i_tunnel().map(|s| s[i])),
            sci(point.pos_z().map(|s| s[i])),
        )
        .map_err(write_err)?;
    }
    out.flush().map_err(write_err)?;

    Ok(())
}

fn text<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "None".to_string())
}

fn list(values: Option<&[f64]>) -> String {
    match values {
        Some(values) => {
            let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            format!("[{}]", items.join(", "))
        }
        None => "None".to_string(),
    }
}

fn sci(value: Option<f64>) -> String {
    value.map(|v| format!("{v:e}")).unwrap_or_else(|| "nan".to_string())
}

fn fixed(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "nan".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GridOptions, SynthOptions, generate_grid};
    use crate::domain::Parallelism;
    use crate::fit::SearchOptions;

    fn fitted_grid() -> Grid {
        let sweeps = generate_grid(&SynthOptions {
            nx: 2,
            ny: 1,
            samples: 80,
            ..SynthOptions::default()
        })
        .unwrap();
        let mut grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        grid.fit_all(Parallelism::Sequential, &SearchOptions::default()).unwrap();
        grid
    }

    #[test]
    fn exports_every_point() {
        let grid = fitted_grid();
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("out");

        let n = write_grid_csv(&folder, &grid, ExportSelection::All).unwrap();
        assert_eq!(n, 2);

        let summary = std::fs::read_to_string(folder.join("grid.csv")).unwrap();
        assert!(summary.starts_with("GRID DATA"));
        assert!(summary.contains("dimension x : 2"));
        let rows: Vec<&str> = summary.lines().skip_while(|l| !l.starts_with("no;")).skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("0;0;0;0;1;0;"));

        let point = std::fs::read_to_string(folder.join("bees_0001.csv")).unwrap();
        let data: Vec<&str> = point
            .lines()
            .skip_while(|l| !l.starts_with("bias;"))
            .skip(1)
            .collect();
        assert_eq!(data.len(), 80);
        assert!(data.iter().all(|l| l.split(';').count() == 5));
    }

    #[test]
    fn fitted_column_is_empty_outside_window() {
        let grid = fitted_grid();
        let point = &grid.points()[0];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.csv");
        write_point_csv(&path, point).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let window = point.window();
        for line in body.lines().skip_while(|l| !l.starts_with("bias;")).skip(1) {
            let cols: Vec<&str> = line.split(';').collect();
            let v: f64 = cols[0].parse().unwrap();
            assert_eq!(cols[2] == "nan", !(window.contains(v) && point.estimate().is_some()));
        }
    }

    #[test]
    fn good_selection_can_be_empty() {
        let grid = fitted_grid();
        let dir = tempfile::tempdir().unwrap();
        let n = write_grid_csv(dir.path(), &grid, ExportSelection::Good(1.0)).unwrap();
        assert_eq!(n, 0);
    }
}
