//! Reporting utilities: barrier statistics and point rankings.

pub mod format;

pub use format::*;

use crate::data::PointFit;
use crate::math::mean;

/// Distribution of the primary barrier height over a set of points.
#[derive(Debug, Clone, PartialEq)]
pub struct BarrierStats {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (0 for a single point).
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl BarrierStats {
    /// `None` when no point carries an estimate.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a PointFit>) -> Option<Self> {
        let phis: Vec<f64> = points
            .into_iter()
            .filter_map(|p| p.barrier_heights().map(|b| b[0]))
            .collect();
        let m = mean(&phis)?;
        let std = if phis.len() > 1 {
            (phis.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (phis.len() - 1) as f64).sqrt()
        } else {
            0.0
        };
        Some(Self {
            count: phis.len(),
            mean: m,
            std,
            min: phis.iter().copied().fold(f64::INFINITY, f64::min),
            max: phis.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// The `top_n` points with the best r² (points without one are skipped).
pub fn rank_by_r_squared(points: &[PointFit], top_n: usize) -> Vec<&PointFit> {
    let mut ranked: Vec<(&PointFit, f64)> = points
        .iter()
        .filter_map(|p| p.r_squared().map(|r2| (p, r2)))
        .collect();
    // Ties keep grid order.
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.into_iter().take(top_n).map(|(p, _)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Grid, GridOptions, SynthOptions, generate_grid};
    use crate::domain::Parallelism;
    use crate::fit::SearchOptions;

    #[test]
    fn stats_and_ranking_of_fitted_grid() {
        let sweeps = generate_grid(&SynthOptions {
            nx: 3,
            ny: 1,
            barrier_spread: 0.0,
            ..SynthOptions::default()
        })
        .unwrap();
        let mut grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        assert!(BarrierStats::from_points(grid.points()).is_none());

        grid.fit_all(Parallelism::Sequential, &SearchOptions::default()).unwrap();
        let stats = BarrierStats::from_points(grid.points()).unwrap();
        assert_eq!(stats.count, 3);
        assert!((stats.mean + 0.8).abs() < 0.01, "{stats:?}");
        assert!(stats.min <= stats.mean && stats.mean <= stats.max);

        let ranked = rank_by_r_squared(grid.points(), 2);
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].r_squared() >= ranked[1].r_squared());
    }
}
