//! Per-point aggregate of sweeps and its fit state.
//!
//! A `PointFit` owns every sweep that shares one `SpatialFitKey`:
//!
//! - the bias axis is the first sweep's
//! - BEEM current, tunnel current and tip height are combined across sweeps
//!   (mean or median), then optionally smoothed
//! - the fit window selects a contiguous bias range out of those series
//!
//! Fit state only changes through `apply`, which takes the `FitOutcome` of a
//! search. `fit_job` copies out exactly what a worker needs, so a grid can fit
//! points on a thread pool and merge the outcomes afterwards.

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::data::sweep::Sweep;
use crate::domain::{BiasWindow, Combine, FitStatus, InitialGuess, Smoothing, SpatialFitKey};
use crate::error::{AppError, FitError};
use crate::fit::{FitOutcome, PointEstimate, SearchOptions, auto_range_fit, plain_fit};
use crate::math::{mean, median_mut, r_squared};
use crate::models::EmissionModel;

/// Default emission exponent (Bell-Kaiser).
pub const DEFAULT_ORDER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
struct Aggregates {
    i_beem: Option<Vec<f64>>,
    i_tunnel: Option<Vec<f64>>,
    pos_z: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct PointFit {
    key: SpatialFitKey,
    sweeps: Vec<Arc<Sweep>>,

    model: EmissionModel,
    order: f64,
    combine: Combine,
    smoothing: Smoothing,
    guess: InitialGuess,
    auto_range: bool,

    data_range: BiasWindow,
    window: BiasWindow,
    mask: Vec<bool>,
    aggregates: Aggregates,

    status: FitStatus,
    estimate: Option<PointEstimate>,
    iterations: usize,
    failure: Option<FitError>,
}

impl PointFit {
    /// Group `sweeps` under `key`. The window starts at the full bias range.
    pub fn new(key: SpatialFitKey, sweeps: Vec<Arc<Sweep>>, model: EmissionModel) -> Result<Self, AppError> {
        let first = sweeps
            .first()
            .ok_or_else(|| AppError::new(3, format!("Point {key} has no sweeps.")))?;
        let data_range = BiasWindow::spanning(&first.bias)
            .ok_or_else(|| AppError::new(3, format!("Point {key}: bias does not span a range.")))?;

        let combine = Combine::default();
        let smoothing = Smoothing::default();
        let aggregates = aggregate(&sweeps, combine, smoothing);
        let mask = mask_for(&first.bias, &data_range);

        Ok(Self {
            key,
            sweeps,
            model,
            order: DEFAULT_ORDER,
            combine,
            smoothing,
            guess: InitialGuess::default(),
            auto_range: true,
            data_range,
            window: data_range,
            mask,
            aggregates,
            status: FitStatus::Unfitted,
            estimate: None,
            iterations: 0,
            failure: None,
        })
    }

    pub fn key(&self) -> SpatialFitKey {
        self.key
    }

    pub fn sweeps(&self) -> &[Arc<Sweep>] {
        &self.sweeps
    }

    pub fn model(&self) -> EmissionModel {
        self.model
    }

    pub fn order(&self) -> f64 {
        self.order
    }

    pub fn combine(&self) -> Combine {
        self.combine
    }

    pub fn smoothing(&self) -> Smoothing {
        self.smoothing
    }

    pub fn guess(&self) -> &InitialGuess {
        &self.guess
    }

    pub fn auto_range(&self) -> bool {
        self.auto_range
    }

    pub fn window(&self) -> BiasWindow {
        self.window
    }

    /// Full bias extent of the point's data.
    pub fn data_range(&self) -> BiasWindow {
        self.data_range
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn estimate(&self) -> Option<&PointEstimate> {
        self.estimate.as_ref()
    }

    /// Search iterations used by the last fit.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Why the last plain fit failed, if it did.
    pub fn failure(&self) -> Option<&FitError> {
        self.failure.as_ref()
    }

    pub fn barrier_heights(&self) -> Option<&[f64]> {
        self.estimate.as_ref().map(|e| e.barrier_heights.as_slice())
    }

    pub fn trans_coefficients(&self) -> Option<&[f64]> {
        self.estimate.as_ref().map(|e| e.trans_coefficients.as_slice())
    }

    pub fn noise_offset(&self) -> Option<f64> {
        self.estimate.as_ref().map(|e| e.noise_offset)
    }

    pub fn barrier_height_errs(&self) -> Vec<f64> {
        match &self.estimate {
            Some(e) => e.barrier_height_errs.clone(),
            None => vec![f64::INFINITY; self.guess.barrier_count()],
        }
    }

    pub fn trans_coefficient_errs(&self) -> Vec<f64> {
        match &self.estimate {
            Some(e) => e.trans_coefficient_errs.clone(),
            None => vec![f64::INFINITY; self.guess.barrier_count()],
        }
    }

    pub fn noise_offset_err(&self) -> f64 {
        self.estimate.as_ref().map_or(f64::INFINITY, |e| e.noise_offset_err)
    }

    // ---- Series ----------------------------------------------------------

    pub fn bias(&self) -> &[f64] {
        &self.sweeps[0].bias
    }

    /// Combined BEEM current; `None` if the sweeps differ in length.
    pub fn i_beem(&self) -> Option<&[f64]> {
        self.aggregates.i_beem.as_deref()
    }

    pub fn i_tunnel(&self) -> Option<&[f64]> {
        self.aggregates.i_tunnel.as_deref()
    }

    pub fn pos_z(&self) -> Option<&[f64]> {
        self.aggregates.pos_z.as_deref()
    }

    pub fn bias_fitted(&self) -> Vec<f64> {
        masked(self.bias(), &self.mask)
    }

    pub fn i_beem_fitted(&self) -> Option<Vec<f64>> {
        self.i_beem().map(|s| masked(s, &self.mask))
    }

    pub fn i_tunnel_fitted(&self) -> Option<Vec<f64>> {
        self.i_tunnel().map(|s| masked(s, &self.mask))
    }

    pub fn pos_z_fitted(&self) -> Option<Vec<f64>> {
        self.pos_z().map(|s| masked(s, &self.mask))
    }

    /// Model current over the window, from the current estimate.
    pub fn i_beem_estimated(&self) -> Option<Vec<f64>> {
        let estimate = self.estimate.as_ref()?;
        Some(
            self.model
                .evaluate(&self.bias_fitted(), self.order, &estimate.to_params()),
        )
    }

    /// Coefficient of determination over the window.
    pub fn r_squared(&self) -> Option<f64> {
        let estimated = self.i_beem_estimated()?;
        let sampled = self.i_beem_fitted()?;
        r_squared(&sampled, &estimated)
    }

    /// Transmission coefficients normalized by the mean tunnel current.
    pub fn trans_resistance(&self) -> Option<Vec<f64>> {
        let tunnel = mean(self.i_tunnel()?)?;
        let coefficients = self.trans_coefficients()?;
        Some(coefficients.iter().map(|a| a / tunnel).collect())
    }

    pub fn trans_resistance_err(&self) -> Option<Vec<f64>> {
        let tunnel = mean(self.i_tunnel()?)?;
        let errs = &self.estimate.as_ref()?.trans_coefficient_errs;
        Some(errs.iter().map(|e| e / tunnel).collect())
    }

    // ---- Metadata (defined only when every sweep agrees) -----------------

    pub fn pos_x(&self) -> Option<f64> {
        self.agreed(|s| s.pos_x)
    }

    pub fn pos_y(&self) -> Option<f64> {
        self.agreed(|s| s.pos_y)
    }

    pub fn sample(&self) -> Option<String> {
        self.agreed(|s| s.sample.clone()).flatten()
    }

    pub fn device(&self) -> Option<String> {
        self.agreed(|s| s.device.clone()).flatten()
    }

    pub fn acquired_at(&self) -> Option<NaiveDateTime> {
        self.agreed(|s| s.acquired_at).flatten()
    }

    fn agreed<T: PartialEq>(&self, field: impl Fn(&Sweep) -> T) -> Option<T> {
        let first = field(self.sweeps[0].as_ref());
        self.sweeps[1..]
            .iter()
            .all(|s| field(s.as_ref()) == first)
            .then_some(first)
    }

    // ---- Setters ---------------------------------------------------------

    pub fn set_order(&mut self, order: f64) {
        self.order = order;
    }

    pub fn set_guess(&mut self, guess: InitialGuess) {
        self.guess = guess;
    }

    pub fn set_auto_range(&mut self, auto_range: bool) {
        self.auto_range = auto_range;
    }

    pub fn set_model(&mut self, model: EmissionModel) {
        self.model = model;
    }

    /// Restrict the fit window; the result is clipped to the data range.
    pub fn set_window(&mut self, min: f64, max: f64) -> Result<(), FitError> {
        let window = BiasWindow::new(min, max)
            .and_then(|w| w.clamp_to(&self.data_range))
            .ok_or_else(|| FitError::invalid_window(min, max))?;
        self.update_window(window);
        Ok(())
    }

    pub fn reset_window(&mut self) {
        self.update_window(self.data_range);
    }

    pub fn set_combine(&mut self, combine: Combine) {
        if combine != self.combine {
            self.combine = combine;
            self.aggregates = aggregate(&self.sweeps, self.combine, self.smoothing);
        }
    }

    pub fn set_smoothing(&mut self, smoothing: Smoothing) {
        if smoothing != self.smoothing {
            self.smoothing = smoothing;
            self.aggregates = aggregate(&self.sweeps, self.combine, self.smoothing);
        }
    }

    fn update_window(&mut self, window: BiasWindow) {
        if window != self.window {
            self.window = window;
            self.mask = mask_for(&self.sweeps[0].bias, &window);
        }
    }

    // ---- Fitting ---------------------------------------------------------

    /// Owned inputs for fitting this point elsewhere.
    pub fn fit_job(&self) -> FitJob {
        let observed = match &self.aggregates.i_beem {
            Some(series) => Ok(series.clone()),
            None => Err(FitError::LengthMismatch {
                bias: self.bias().len(),
                current: self
                    .sweeps
                    .iter()
                    .map(|s| s.i_beem.len())
                    .find(|&n| n != self.bias().len())
                    .unwrap_or(0),
            }),
        };
        FitJob {
            key: self.key,
            model: self.model,
            order: self.order,
            bias: self.bias().to_vec(),
            observed,
            window: self.window,
            guess: self.guess.clone(),
            auto_range: self.auto_range,
        }
    }

    /// Fit in place and return the new status.
    pub fn fit(&mut self, options: &SearchOptions) -> FitStatus {
        let outcome = self.fit_job().run(options);
        self.apply(outcome);
        self.status
    }

    /// Merge a search result into this point.
    pub fn apply(&mut self, outcome: FitOutcome) {
        if let Some(window) = outcome.window().clamp_to(&self.data_range) {
            self.update_window(window);
        }
        self.status = outcome.status();
        match outcome {
            FitOutcome::Converged {
                estimate, iterations, ..
            } => {
                self.estimate = Some(estimate);
                self.iterations = iterations;
                self.failure = None;
            }
            FitOutcome::Failed { reason, .. } => {
                self.estimate = None;
                self.iterations = 1;
                self.failure = Some(reason);
            }
            FitOutcome::Downgraded { iterations, .. } => {
                self.estimate = None;
                self.iterations = iterations;
                self.failure = None;
            }
        }
    }
}

/// Everything a worker needs to fit one point, detached from the grid.
#[derive(Debug, Clone)]
pub struct FitJob {
    pub key: SpatialFitKey,
    pub model: EmissionModel,
    pub order: f64,
    pub bias: Vec<f64>,
    pub observed: Result<Vec<f64>, FitError>,
    pub window: BiasWindow,
    pub guess: InitialGuess,
    pub auto_range: bool,
}

impl FitJob {
    pub fn run(&self, options: &SearchOptions) -> FitOutcome {
        let observed = match &self.observed {
            Ok(series) => series,
            Err(reason) => {
                return FitOutcome::Failed {
                    reason: reason.clone(),
                    window: self.window,
                };
            }
        };
        if self.auto_range {
            auto_range_fit(
                &self.model,
                &self.bias,
                observed,
                self.order,
                self.window,
                &self.guess,
                options,
            )
        } else {
            plain_fit(
                &self.model,
                &self.bias,
                observed,
                self.order,
                self.window,
                &self.guess,
                &options.lm,
            )
        }
    }
}

fn mask_for(bias: &[f64], window: &BiasWindow) -> Vec<bool> {
    bias.iter().map(|v| window.contains(*v)).collect()
}

fn masked(values: &[f64], mask: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .map(|(v, _)| *v)
        .collect()
}

fn aggregate(sweeps: &[Arc<Sweep>], combine: Combine, smoothing: Smoothing) -> Aggregates {
    Aggregates {
        i_beem: aggregate_field(sweeps, combine, smoothing, |s| s.i_beem.as_slice()),
        i_tunnel: aggregate_field(sweeps, combine, smoothing, |s| s.i_tunnel.as_slice()),
        pos_z: aggregate_field(sweeps, combine, smoothing, |s| s.pos_z.as_slice()),
    }
}

fn aggregate_field(
    sweeps: &[Arc<Sweep>],
    combine: Combine,
    smoothing: Smoothing,
    field: fn(&Sweep) -> &[f64],
) -> Option<Vec<f64>> {
    let columns: Vec<&[f64]> = sweeps.iter().map(|s| field(s.as_ref())).collect();
    combine_series(&columns, sweeps[0].bias.len(), combine).map(|s| smooth(&s, smoothing))
}

/// Element-wise combination of equally long series.
pub fn combine_series(series: &[&[f64]], n: usize, combine: Combine) -> Option<Vec<f64>> {
    if series.is_empty() || series.iter().any(|s| s.len() != n) {
        return None;
    }
    if series.len() == 1 {
        return Some(series[0].to_vec());
    }

    let mut column = Vec::with_capacity(series.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        column.clear();
        column.extend(series.iter().map(|s| s[i]));
        let value = match combine {
            Combine::Mean => mean(&column),
            Combine::Median => median_mut(&mut column),
        };
        out.push(value.unwrap_or(f64::NAN));
    }
    Some(out)
}

/// Centered moving average; the window shrinks near the ends.
pub fn smooth(values: &[f64], smoothing: Smoothing) -> Vec<f64> {
    let width = match smoothing {
        Smoothing::MovingAverage(width) if width > 1 => width,
        _ => return values.to_vec(),
    };
    let half = width / 2;
    let n = values.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            let slice = &values[lo..hi];
            slice.iter().sum::<f64>() / slice.len() as f64
        })
        .collect()
}
