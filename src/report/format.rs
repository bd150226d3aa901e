//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use crate::data::{Grid, GridFitSummary, PointFit};
use crate::report::{BarrierStats, rank_by_r_squared};

/// Format the run summary: grid shape, status counts and barrier statistics.
pub fn format_run_summary(grid: &Grid, summary: &GridFitSummary, r_squared_min: f64) -> String {
    let mut out = String::new();

    out.push_str("=== beem - BEEM spectroscopy fit ===\n");
    out.push_str(&format!(
        "Grid: {} x {} positions | {} sweep number(s) | {} pass(es) | {} points\n",
        grid.num_x(),
        grid.num_y(),
        grid.num_sweep(),
        grid.num_pass(),
        grid.len(),
    ));
    if let Some(p) = grid.points().first() {
        out.push_str(&format!(
            "Model: Bell-Kaiser (V correction), n={} | backend={:?}\n",
            p.order(),
            p.model().backend()
        ));
    }

    out.push_str("\nFit status:\n");
    for (label, count) in [
        ("converged", summary.converged),
        ("exhausted", summary.exhausted),
        ("downgraded", summary.downgraded),
        ("failed", summary.failed),
        ("unfitted", summary.unfitted),
    ] {
        out.push_str(&format!("  {label:<11}{count:>6}\n"));
    }

    let good = grid.extract_good(r_squared_min);
    out.push_str(&format!("  {:<11}{:>6}  (r² > {r_squared_min})\n", "good", good.len()));

    out.push_str("\nBarrier height (good points):\n");
    match BarrierStats::from_points(good.iter().copied()) {
        Some(stats) => out.push_str(&format!(
            "  n={} mean={:.4} V std={:.4} V range=[{:.4}, {:.4}] V\n",
            stats.count, stats.mean, stats.std, stats.min, stats.max
        )),
        None => out.push_str("  (no good points)\n"),
    }
    out.push('\n');

    out
}

/// Table of the best points by r².
pub fn format_point_table(points: &[PointFit], top_n: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("Top {top_n} points by r²:\n"));
    out.push_str(
        format!(
            "{:<20} {:>10} {:>10} {:>12} {:>8} {:<10}\n",
            "point", "phi (V)", "err (V)", "R", "r2", "status"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(format!("{:-<20} {:-<10} {:-<10} {:-<12} {:-<8} {:-<10}\n", "", "", "", "", "", "").trim_end());
    out.push('\n');

    for p in rank_by_r_squared(points, top_n) {
        out.push_str(
            format!(
                "{:<20} {:>10} {:>10} {:>12} {:>8} {:<10}\n",
                p.key().to_string(),
                fmt_opt(p.barrier_heights().map(|b| b[0]), 4),
                fmt_opt(p.barrier_height_errs().first().copied(), 4),
                fmt_sci(p.trans_resistance().map(|r| r[0])),
                fmt_opt(p.r_squared(), 4),
                p.status().display_name(),
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out
}

fn fmt_opt(v: Option<f64>, digits: usize) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{v:.digits$}"),
        Some(_) => "inf".to_string(),
        None => "-".to_string(),
    }
}

fn fmt_sci(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{v:.3e}"),
        _ => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GridOptions, SynthOptions, generate_grid};
    use crate::domain::Parallelism;
    use crate::fit::SearchOptions;

    #[test]
    fn summary_mentions_counts_and_barrier() {
        let sweeps = generate_grid(&SynthOptions {
            nx: 2,
            ny: 2,
            ..SynthOptions::default()
        })
        .unwrap();
        let mut grid = Grid::new(sweeps, &GridOptions::default()).unwrap();
        let summary = grid.fit_all(Parallelism::Sequential, &SearchOptions::default()).unwrap();

        let text = format_run_summary(&grid, &summary, 0.6);
        assert!(text.contains("Grid: 2 x 2 positions"));
        assert!(text.contains("converged"));
        assert!(text.contains("mean="));

        let table = format_point_table(grid.points(), 3);
        assert_eq!(table.lines().count(), 3 + 3);
        assert!(table.lines().nth(3).unwrap().starts_with("00"));
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(fmt_opt(None, 2), "-");
        assert_eq!(fmt_opt(Some(f64::INFINITY), 2), "inf");
        assert_eq!(fmt_opt(Some(-0.80123), 3), "-0.801");
        assert_eq!(fmt_sci(Some(1234.0)), "1.234e3");
    }
}
