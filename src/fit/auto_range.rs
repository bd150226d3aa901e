//! Bias-window search around the primary barrier.
//!
//! A BEEM spectrum is only described by the emission law near and beyond the
//! barrier; far from it the current is dominated by other processes. The
//! search therefore fits a window whose outer edge tracks the current estimate
//! of `φ₁`:
//!
//! - the starting barrier's sign picks the bound first placed at `φ₁ ∓ margin`
//! - after that the outer side is the one away from zero: `min` when the
//!   window lies at negative bias, `max` otherwise; the inner bound is never
//!   touched
//! - a fit that fails, or whose `|σφ₁ / φ₁|` exceeds `reject_rel_err`, widens
//!   the window by `margin` (never past the data) and keeps the old guess
//! - an accepted fit moves the outer bound to `φ₁ ∓ margin` and becomes the
//!   next guess
//! - the search stops once `φ₁` moves by less than `tol` between iterations
//!
//! Every path returns a `FitOutcome`; numerical trouble is data, not a panic.

use crate::domain::{BiasWindow, InitialGuess};
use crate::error::FitError;
use crate::fit::curve_fit::{CurveFit, curve_fit};
use crate::fit::outcome::{FitOutcome, PointEstimate};
use crate::math::LmOptions;
use crate::models::EmissionModel;

/// Knobs of the window search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Distance kept between `φ₁` and the outer window bound, in volts.
    pub margin: f64,
    /// Change of `φ₁` between iterations considered converged.
    pub tol: f64,
    pub max_iterations: usize,
    /// Weight of the new estimate when moving the outer bound (1 = jump to it).
    pub conv_ratio: f64,
    pub reject_rel_err: f64,
    pub final_rel_err: f64,
    pub lm: LmOptions,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            margin: 0.4,
            tol: 0.001,
            max_iterations: 10,
            conv_ratio: 1.0,
            reject_rel_err: 0.04,
            final_rel_err: 0.1,
            lm: LmOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Min,
    Max,
}

impl Side {
    fn of(phi: f64) -> Self {
        if phi < 0.0 { Side::Min } else { Side::Max }
    }

    /// `φ` pushed `margin` away from the inner bound.
    fn beyond(self, phi: f64, margin: f64) -> f64 {
        match self {
            Side::Min => phi - margin,
            Side::Max => phi + margin,
        }
    }

    /// Side moved by the search once the window is placed.
    fn of_window(window: &BiasWindow) -> Self {
        if window.max() < 0.0 { Side::Min } else { Side::Max }
    }

    /// Data extremum the outer bound may not cross.
    fn limit(self, data: &BiasWindow) -> f64 {
        self.outer(data)
    }

    fn outer(self, window: &BiasWindow) -> f64 {
        match self {
            Side::Min => window.min(),
            Side::Max => window.max(),
        }
    }

    /// Move the outer bound to `bound`, clamped to `lim`.
    ///
    /// Returns the window unchanged if the result would not be a valid window.
    fn with_outer(self, window: BiasWindow, bound: f64, lim: f64) -> BiasWindow {
        let moved = match self {
            Side::Min => BiasWindow::new(bound.max(lim), window.max()),
            Side::Max => BiasWindow::new(window.min(), bound.min(lim)),
        };
        moved.unwrap_or(window)
    }
}

/// Restart point for a fit that came back unchanged: `(φ·1.1, a·0.1)`.
fn nudged(guess: &InitialGuess) -> InitialGuess {
    InitialGuess {
        noise: guess.noise,
        barrier_heights: guess.barrier_heights.iter().map(|p| p * 1.1).collect(),
        trans_coefficients: guess.trans_coefficients.iter().map(|a| a * 0.1).collect(),
    }
}

/// Samples of `(bias, observed)` that fall inside `window`.
pub fn select(bias: &[f64], observed: &[f64], window: &BiasWindow) -> (Vec<f64>, Vec<f64>) {
    bias.iter()
        .zip(observed)
        .filter(|(v, _)| window.contains(**v))
        .map(|(v, y)| (*v, *y))
        .unzip()
}

/// One fit over `window`, no window adjustment.
pub fn plain_fit(
    model: &EmissionModel,
    bias: &[f64],
    observed: &[f64],
    order: f64,
    window: BiasWindow,
    guess: &InitialGuess,
    lm: &LmOptions,
) -> FitOutcome {
    let (b, o) = select(bias, observed, &window);
    let fit = curve_fit(model, &guess.to_params(), &b, &o, order, lm);
    match fit {
        CurveFit::Failed { reason } => FitOutcome::Failed { reason, window },
        CurveFit::Converged { .. } => match fit.estimate() {
            Some(estimate) => FitOutcome::Converged {
                estimate,
                window,
                iterations: 1,
                within_tolerance: true,
            },
            None => FitOutcome::Failed {
                reason: FitError::InvalidParameters(guess.to_params().len()),
                window,
            },
        },
    }
}

/// Search for a window in which `φ₁` is self-consistent, then fit it.
///
/// `window` is the starting window, normally the full data range.
pub fn auto_range_fit(
    model: &EmissionModel,
    bias: &[f64],
    observed: &[f64],
    order: f64,
    window: BiasWindow,
    guess: &InitialGuess,
    options: &SearchOptions,
) -> FitOutcome {
    let k = guess.barrier_count();
    if k == 0 || guess.trans_coefficients.len() != k {
        return FitOutcome::Failed {
            reason: FitError::InvalidParameters(guess.to_params().len()),
            window,
        };
    }
    let Some(data) = BiasWindow::spanning(bias) else {
        return FitOutcome::Failed {
            reason: FitError::EmptySample,
            window,
        };
    };

    let start = Side::of(guess.barrier_heights[0]);
    let mut window = start.with_outer(
        window,
        start.beyond(guess.barrier_heights[0], options.margin),
        start.limit(&data),
    );
    let side = Side::of_window(&window);
    let lim = side.limit(&data);

    let mut current = guess.clone();
    let mut last: Option<PointEstimate> = None;
    let mut iterations = 0;

    for iteration in 1..=options.max_iterations {
        iterations = iteration;
        let (b, o) = select(bias, observed, &window);
        let mut estimate = curve_fit(model, &current.to_params(), &b, &o, order, &options.lm).estimate();

        // A fit that did not move at all is usually stuck on a flat start.
        if estimate
            .as_ref()
            .is_some_and(|e| e.barrier_heights == current.barrier_heights)
        {
            estimate = curve_fit(model, &nudged(&current).to_params(), &b, &o, order, &options.lm).estimate();
        }

        let guess_phi = current.barrier_heights[0];
        tracing::debug!(
            iteration,
            window_min = window.min(),
            window_max = window.max(),
            samples = b.len(),
            phi = estimate.as_ref().map(|e| e.primary_barrier()),
            "auto-range step"
        );

        let Some(est) = estimate else {
            window = side.with_outer(window, side.beyond(side.outer(&window), options.margin), lim);
            last = None;
            continue;
        };

        let phi = est.primary_barrier();
        if (phi - guess_phi).abs() < options.tol {
            return FitOutcome::Converged {
                estimate: est,
                window,
                iterations: iteration,
                within_tolerance: true,
            };
        }

        if est.primary_relative_error() > options.reject_rel_err {
            window = side.with_outer(window, side.beyond(side.outer(&window), options.margin), lim);
            last = Some(est);
            continue;
        }

        let mut next_phi = phi;
        if !window.contains(phi) {
            next_phi = window.midpoint();
        } else {
            let target = options.conv_ratio * phi + (1.0 - options.conv_ratio) * guess_phi;
            window = side.with_outer(window, side.beyond(target, options.margin), lim);
        }

        current = InitialGuess {
            noise: est.noise_offset,
            barrier_heights: est.barrier_heights.clone(),
            trans_coefficients: est.trans_coefficients.clone(),
        };
        current.barrier_heights[0] = next_phi;
        last = Some(est);
    }

    match last {
        Some(estimate) if estimate.primary_relative_error() <= options.final_rel_err => FitOutcome::Converged {
            estimate,
            window,
            iterations,
            within_tolerance: false,
        },
        _ => FitOutcome::Downgraded { window, iterations },
    }
}
