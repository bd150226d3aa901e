//! A spatial grid of sweeps and the points fitted from them.
//!
//! Construction:
//! - every sweep is validated
//! - distinct x / y tip positions are sorted and become grid indices
//! - repeat acquisitions of the same (position, sweep number, direction) get
//!   pass numbers according to `PassMode`
//! - sweeps sharing a key are grouped into one `PointFit`
//!
//! Points live in a `Vec` ordered by key with a `HashMap` index beside it;
//! relational queries (reverse direction, next sweep, ...) are key lookups.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::point_fit::{DEFAULT_ORDER, FitJob, PointFit};
use crate::data::sweep::Sweep;
use crate::domain::{Combine, Direction, FitStatus, InitialGuess, Parallelism, PassMode, Smoothing, SpatialFitKey};
use crate::error::AppError;
use crate::fit::{FitOutcome, SearchOptions};
use crate::models::EmissionModel;

/// Settings applied to every point when a grid is built.
#[derive(Debug, Clone, PartialEq)]
pub struct GridOptions {
    pub pass_mode: PassMode,
    pub model: EmissionModel,
    pub order: f64,
    pub combine: Combine,
    pub smoothing: Smoothing,
    pub guess: InitialGuess,
    pub auto_range: bool,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            pass_mode: PassMode::default(),
            model: EmissionModel::default(),
            order: DEFAULT_ORDER,
            combine: Combine::default(),
            smoothing: Smoothing::default(),
            guess: InitialGuess::default(),
            auto_range: true,
        }
    }
}

/// Point counts per fit status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridFitSummary {
    pub total: usize,
    pub converged: usize,
    pub exhausted: usize,
    pub failed: usize,
    pub downgraded: usize,
    pub unfitted: usize,
}

impl GridFitSummary {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a PointFit>) -> Self {
        let mut summary = Self::default();
        for p in points {
            summary.total += 1;
            match p.status() {
                FitStatus::Converged => summary.converged += 1,
                FitStatus::Exhausted => summary.exhausted += 1,
                FitStatus::Failed => summary.failed += 1,
                FitStatus::Downgraded => summary.downgraded += 1,
                FitStatus::Unfitted => summary.unfitted += 1,
            }
        }
        summary
    }

    /// Points that carry an estimate.
    pub fn with_estimate(&self) -> usize {
        self.converged + self.exhausted
    }
}

#[derive(Debug, Clone)]
pub struct Grid {
    sweeps: Vec<Arc<Sweep>>,
    sweep_index: HashMap<SpatialFitKey, Vec<usize>>,
    points: Vec<PointFit>,
    point_index: HashMap<SpatialFitKey, usize>,
    x_positions: Vec<f64>,
    y_positions: Vec<f64>,
    num_sweep: u32,
    num_pass: u32,
    pass_mode: PassMode,
}

impl Grid {
    pub fn new(mut sweeps: Vec<Sweep>, options: &GridOptions) -> Result<Self, AppError> {
        if sweeps.is_empty() {
            return Err(AppError::new(3, "Grid has no sweeps."));
        }
        for s in &sweeps {
            s.validate()?;
        }

        let x_positions = distinct_sorted(sweeps.iter().map(|s| s.pos_x));
        let y_positions = distinct_sorted(sweeps.iter().map(|s| s.pos_y));

        assign_keys(&mut sweeps, &x_positions, &y_positions, options.pass_mode)?;
        // Stable: repeats sharing a key (merged passes) keep their input order.
        sweeps.sort_by_key(|s| s.key);

        let sweeps: Vec<Arc<Sweep>> = sweeps.into_iter().map(Arc::new).collect();
        let mut sweep_index: HashMap<SpatialFitKey, Vec<usize>> = HashMap::new();
        let mut groups: BTreeMap<SpatialFitKey, Vec<Arc<Sweep>>> = BTreeMap::new();
        let mut num_sweep = 0;
        let mut num_pass = 0;
        for (i, s) in sweeps.iter().enumerate() {
            let key = s
                .key
                .ok_or_else(|| AppError::new(4, "Sweep left without a grid key."))?;
            sweep_index.entry(key).or_default().push(i);
            groups.entry(key).or_default().push(Arc::clone(s));
            num_sweep = num_sweep.max(key.sweep_number + 1);
            num_pass = num_pass.max(key.pass_number);
        }

        let mut points = Vec::with_capacity(groups.len());
        let mut point_index = HashMap::with_capacity(groups.len());
        for (key, group) in groups {
            let mut point = PointFit::new(key, group, options.model)?;
            point.set_order(options.order);
            point.set_combine(options.combine);
            point.set_smoothing(options.smoothing);
            point.set_guess(options.guess.clone());
            point.set_auto_range(options.auto_range);
            point_index.insert(key, points.len());
            points.push(point);
        }

        tracing::debug!(
            sweeps = sweeps.len(),
            points = points.len(),
            num_x = x_positions.len(),
            num_y = y_positions.len(),
            "grid built"
        );

        Ok(Self {
            sweeps,
            sweep_index,
            points,
            point_index,
            x_positions,
            y_positions,
            num_sweep,
            num_pass,
            pass_mode: options.pass_mode,
        })
    }

    pub fn num_x(&self) -> usize {
        self.x_positions.len()
    }

    pub fn num_y(&self) -> usize {
        self.y_positions.len()
    }

    /// Highest sweep number plus one.
    pub fn num_sweep(&self) -> u32 {
        self.num_sweep
    }

    /// Highest pass number.
    pub fn num_pass(&self) -> u32 {
        self.num_pass
    }

    pub fn x_positions(&self) -> &[f64] {
        &self.x_positions
    }

    pub fn y_positions(&self) -> &[f64] {
        &self.y_positions
    }

    pub fn pass_mode(&self) -> PassMode {
        self.pass_mode
    }

    /// All sweeps, ordered by key.
    pub fn sweeps(&self) -> &[Arc<Sweep>] {
        &self.sweeps
    }

    /// All points, ordered by key.
    pub fn points(&self) -> &[PointFit] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut [PointFit] {
        &mut self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, key: &SpatialFitKey) -> Option<&PointFit> {
        self.point_index.get(key).map(|&i| &self.points[i])
    }

    pub fn point_mut(&mut self, key: &SpatialFitKey) -> Option<&mut PointFit> {
        let i = *self.point_index.get(key)?;
        Some(&mut self.points[i])
    }

    /// First sweep recorded under `key`.
    pub fn sweep(&self, key: &SpatialFitKey) -> Option<&Sweep> {
        let i = *self.sweep_index.get(key)?.first()?;
        Some(&self.sweeps[i])
    }

    /// Every sweep recorded under `key` (several when passes are merged).
    pub fn sweeps_at(&self, key: &SpatialFitKey) -> Vec<&Sweep> {
        self.sweep_index
            .get(key)
            .map(|idx| idx.iter().map(|&i| self.sweeps[i].as_ref()).collect())
            .unwrap_or_default()
    }

    /// Index of each sweep of the point `key` in `sweeps()`.
    pub fn sweep_indices(&self, key: &SpatialFitKey) -> &[usize] {
        self.sweep_index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reverse(&self, key: &SpatialFitKey) -> Option<&PointFit> {
        self.point(&key.reversed())
    }

    pub fn next_sweep(&self, key: &SpatialFitKey) -> Option<&PointFit> {
        self.point(&key.next_sweep())
    }

    pub fn previous_sweep(&self, key: &SpatialFitKey) -> Option<&PointFit> {
        self.point(&key.previous_sweep()?)
    }

    /// Another point at the same position; `pass` defaults to the key's own.
    pub fn same_position(
        &self,
        key: &SpatialFitKey,
        sweep_number: u32,
        direction: Direction,
        pass: Option<u32>,
    ) -> Option<&PointFit> {
        let pass = pass.unwrap_or(key.pass_number);
        self.point(&key.with_sweep(sweep_number, direction, pass))
    }

    pub fn set_order(&mut self, order: f64) {
        for p in &mut self.points {
            p.set_order(order);
        }
    }

    pub fn set_guess(&mut self, guess: &InitialGuess) {
        for p in &mut self.points {
            p.set_guess(guess.clone());
        }
    }

    /// Fit every point and merge the outcomes back by key.
    ///
    /// Each point is fitted from an owned `FitJob`, so the outcome does not
    /// depend on the execution mode.
    pub fn fit_all(&mut self, parallelism: Parallelism, options: &SearchOptions) -> Result<GridFitSummary, AppError> {
        let start = Instant::now();
        let jobs: Vec<FitJob> = self.points.iter().map(PointFit::fit_job).collect();
        let run = |job: &FitJob| (job.key, job.run(options));

        let outcomes: Vec<(SpatialFitKey, FitOutcome)> = match parallelism {
            Parallelism::Sequential => jobs.iter().map(run).collect(),
            Parallelism::Auto => jobs.par_iter().map(run).collect(),
            Parallelism::Threads(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| AppError::new(4, format!("Failed to start worker pool: {e}")))?;
                pool.install(|| jobs.par_iter().map(run).collect())
            }
        };

        for (key, outcome) in outcomes {
            let i = *self
                .point_index
                .get(&key)
                .ok_or_else(|| AppError::new(4, format!("Fit result for unknown point {key}.")))?;
            self.points[i].apply(outcome);
        }

        for p in &self.points {
            match p.status() {
                FitStatus::Failed => {
                    let reason = p.failure().map(ToString::to_string).unwrap_or_default();
                    tracing::warn!(point = %p.key(), %reason, "fit failed");
                }
                FitStatus::Downgraded => {
                    tracing::warn!(point = %p.key(), iterations = p.iterations(), "estimate discarded");
                }
                _ => {}
            }
        }

        let summary = GridFitSummary::from_points(&self.points);
        tracing::info!(
            points = summary.total,
            converged = summary.converged,
            exhausted = summary.exhausted,
            downgraded = summary.downgraded,
            failed = summary.failed,
            mode = ?parallelism,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "grid fit finished"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> GridFitSummary {
        GridFitSummary::from_points(&self.points)
    }

    /// Points with `threshold < r² < 1`.
    pub fn extract_good(&self, threshold: f64) -> Vec<&PointFit> {
        self.points
            .iter()
            .filter(|p| is_good(p.r_squared(), threshold))
            .collect()
    }
}

/// Strict on both ends; an undefined r² is never good.
pub fn is_good(r_squared: Option<f64>, threshold: f64) -> bool {
    r_squared.is_some_and(|r2| r2 > threshold && r2 < 1.0)
}

// `+ 0.0` folds -0.0 into 0.0 so both land on the same axis index.
fn distinct_sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut out: Vec<f64> = values.map(|v| v + 0.0).collect();
    out.sort_by(|a, b| a.total_cmp(b));
    out.dedup();
    out
}

fn position_index(positions: &[f64], value: f64) -> Result<usize, AppError> {
    positions
        .binary_search_by(|p| p.total_cmp(&(value + 0.0)))
        .map_err(|_| AppError::new(4, format!("Position {value} missing from grid axis.")))
}

fn assign_keys(sweeps: &mut [Sweep], xs: &[f64], ys: &[f64], pass_mode: PassMode) -> Result<(), AppError> {
    let mut acquisitions: BTreeMap<(usize, usize, u32, Direction), Vec<usize>> = BTreeMap::new();
    for (i, s) in sweeps.iter().enumerate() {
        let x = position_index(xs, s.pos_x)?;
        let y = position_index(ys, s.pos_y)?;
        acquisitions
            .entry((x, y, s.sweep_number, s.direction))
            .or_default()
            .push(i);
    }

    for ((x_index, y_index, sweep_number, direction), mut members) in acquisitions {
        if pass_mode == PassMode::Chronological {
            // Stable, so untimed or simultaneous repeats keep input order.
            members.sort_by_key(|&i| sweeps[i].acquired_at);
        }
        for (rank, i) in members.into_iter().enumerate() {
            let pass_number = match pass_mode {
                PassMode::Chronological => rank as u32 + 1,
                PassMode::Merged => 1,
            };
            sweeps[i].key = Some(SpatialFitKey {
                x_index,
                y_index,
                pass_number,
                sweep_number,
                direction,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn sweep_at(x: f64, y: f64, number: u32, direction: Direction, t: Option<i64>) -> Sweep {
        let bias: Vec<f64> = (0..8).map(|i| -2.0 + 0.25 * i as f64).collect();
        let n = bias.len();
        let mut s = Sweep::new(bias, vec![1.0; n], vec![0.0; n], vec![0.0; n], x, y);
        s.sweep_number = number;
        s.direction = direction;
        s.acquired_at = t.and_then(|t| DateTime::from_timestamp(t, 0)).map(|d| d.naive_utc());
        s
    }

    #[test]
    fn good_points_are_strictly_inside_threshold_and_one() {
        let r2 = [Some(0.9), Some(0.5), Some(1.0), Some(0.7), None];
        let kept: Vec<usize> = (0..r2.len()).filter(|&i| is_good(r2[i], 0.6)).collect();
        assert_eq!(kept, vec![0, 3]);
        assert!(!is_good(Some(0.6), 0.6));
    }

    #[test]
    fn indices_follow_sorted_positions() {
        let sweeps = vec![
            sweep_at(5.0, 1.0, 0, Direction::Forward, None),
            sweep_at(-3.0, 1.0, 0, Direction::Forward, None),
            sweep_at(5.0, -1.0, 0, Direction::Forward, None),
        ];
        let grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        assert_eq!(grid.x_positions(), &[-3.0, 5.0]);
        assert_eq!(grid.y_positions(), &[-1.0, 1.0]);
        assert_eq!((grid.num_x(), grid.num_y()), (2, 2));
        for p in grid.points() {
            let k = p.key();
            assert_eq!(p.pos_x(), Some(grid.x_positions()[k.x_index]));
            assert_eq!(p.pos_y(), Some(grid.y_positions()[k.y_index]));
        }
    }

    #[test]
    fn repeats_are_numbered_by_time() {
        let sweeps = vec![
            sweep_at(0.0, 0.0, 0, Direction::Forward, Some(300)),
            sweep_at(0.0, 0.0, 0, Direction::Forward, Some(100)),
            sweep_at(0.0, 0.0, 0, Direction::Forward, Some(200)),
        ];
        let grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.num_pass(), 3);

        let first = grid.points()[0].key();
        assert_eq!(first.pass_number, 1);
        let t = |p: &PointFit| p.acquired_at().map(|d| d.and_utc().timestamp());
        assert_eq!(t(&grid.points()[0]), Some(100));
        assert_eq!(t(&grid.points()[2]), Some(300));
    }

    #[test]
    fn merged_passes_share_one_point() {
        let sweeps = vec![
            sweep_at(0.0, 0.0, 0, Direction::Forward, Some(300)),
            sweep_at(0.0, 0.0, 0, Direction::Forward, Some(100)),
        ];
        let options = GridOptions {
            pass_mode: PassMode::Merged,
            ..GridOptions::default()
        };
        let grid = Grid::new(sweeps, &options).unwrap();
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.points()[0].sweeps().len(), 2);
        assert_eq!(grid.sweeps_at(&grid.points()[0].key()).len(), 2);
        assert_eq!(grid.num_pass(), 1);
    }

    #[test]
    fn every_sweep_lands_in_exactly_one_point() {
        let mut sweeps = Vec::new();
        for x in 0..3 {
            for number in 0..2 {
                for direction in [Direction::Forward, Direction::Backward] {
                    sweeps.push(sweep_at(x as f64, 0.0, number, direction, None));
                }
            }
        }
        let n = sweeps.len();
        let grid = Grid::new(sweeps, &GridOptions::default()).unwrap();

        let grouped: usize = grid.points().iter().map(|p| p.sweeps().len()).sum();
        assert_eq!(grouped, n);
        for p in grid.points() {
            assert!(p.sweeps().iter().all(|s| s.key == Some(p.key())));
            assert_eq!(grid.point(&p.key()).map(PointFit::key), Some(p.key()));
        }
        assert_eq!(grid.num_sweep(), 2);
    }

    #[test]
    fn relational_lookups() {
        let sweeps = vec![
            sweep_at(0.0, 0.0, 0, Direction::Forward, None),
            sweep_at(0.0, 0.0, 0, Direction::Backward, None),
            sweep_at(0.0, 0.0, 1, Direction::Forward, None),
        ];
        let grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        let k = grid.points()[0].key();

        assert_eq!(grid.reverse(&k).map(|p| p.key().direction), Some(Direction::Backward));
        assert_eq!(grid.next_sweep(&k).map(|p| p.key().sweep_number), Some(1));
        assert!(grid.previous_sweep(&k).is_none());
        assert!(grid.next_sweep(&k.next_sweep()).is_none());
        assert!(grid.same_position(&k, 1, Direction::Forward, None).is_some());
        assert!(grid.same_position(&k, 1, Direction::Backward, None).is_none());
    }

    #[test]
    fn empty_and_invalid_input_is_rejected() {
        assert_eq!(Grid::new(Vec::new(), &GridOptions::default()).unwrap_err().exit_code(), 3);

        let mut bad = sweep_at(0.0, 0.0, 0, Direction::Forward, None);
        bad.pos_z.clear();
        assert_eq!(Grid::new(vec![bad], &GridOptions::default()).unwrap_err().exit_code(), 3);

        let mut flat = sweep_at(0.0, 0.0, 0, Direction::Forward, None);
        flat.bias = vec![-1.0; flat.len()];
        let err = Grid::new(vec![flat], &GridOptions::default()).unwrap_err();
        assert!(err.to_string().contains("does not span a range"), "{err}");
    }
}
