//! Typed results of fitting a single point.

use serde::{Deserialize, Serialize};

use crate::domain::{BiasWindow, FitStatus};
use crate::error::FitError;

/// Best-fit parameters of one point plus their standard errors.
///
/// Errors are `+∞` for parameters the data does not identify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEstimate {
    pub noise_offset: f64,
    pub barrier_heights: Vec<f64>,
    pub trans_coefficients: Vec<f64>,
    pub noise_offset_err: f64,
    pub barrier_height_errs: Vec<f64>,
    pub trans_coefficient_errs: Vec<f64>,
}

impl PointEstimate {
    /// Split `[offset, φ.., a..]` and matching errors into named fields.
    ///
    /// Returns `None` if the layout is not `1 + 2k` with `k >= 1`, or the two
    /// vectors differ in length.
    pub fn from_params(params: &[f64], errors: &[f64]) -> Option<Self> {
        let len = params.len();
        if len < 3 || len % 2 == 0 || errors.len() != len {
            return None;
        }
        let k = (len - 1) / 2;
        Some(Self {
            noise_offset: params[0],
            barrier_heights: params[1..1 + k].to_vec(),
            trans_coefficients: params[1 + k..].to_vec(),
            noise_offset_err: errors[0],
            barrier_height_errs: errors[1..1 + k].to_vec(),
            trans_coefficient_errs: errors[1 + k..].to_vec(),
        })
    }

    /// Pack back into the emission-model layout.
    pub fn to_params(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(1 + 2 * self.barrier_heights.len());
        out.push(self.noise_offset);
        out.extend_from_slice(&self.barrier_heights);
        out.extend_from_slice(&self.trans_coefficients);
        out
    }

    pub fn primary_barrier(&self) -> f64 {
        self.barrier_heights[0]
    }

    /// `|σφ₁ / φ₁|`; `+∞` for a zero or non-finite barrier height.
    pub fn primary_relative_error(&self) -> f64 {
        let phi = self.barrier_heights[0];
        let err = self.barrier_height_errs[0];
        let rel = (err / phi).abs();
        if phi != 0.0 && rel.is_finite() { rel } else { f64::INFINITY }
    }
}

/// Result of fitting one point, merged back with `PointFit::apply`.
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// An estimate was accepted.
    ///
    /// `within_tolerance` is false when the auto-range search used up its
    /// iterations without settling but the estimate still passed the final
    /// relative-error gate. The estimate is always the fitted one: when the
    /// search restarted from the window midpoint because `φ₁` fell outside
    /// the window, an exhausted search can return a `φ₁` outside `window`.
    Converged {
        estimate: PointEstimate,
        window: BiasWindow,
        iterations: usize,
        within_tolerance: bool,
    },
    /// A single plain fit failed numerically.
    Failed { reason: FitError, window: BiasWindow },
    /// The search finished with an estimate too uncertain to keep.
    Downgraded { window: BiasWindow, iterations: usize },
}

impl FitOutcome {
    pub fn window(&self) -> BiasWindow {
        match self {
            FitOutcome::Converged { window, .. }
            | FitOutcome::Failed { window, .. }
            | FitOutcome::Downgraded { window, .. } => *window,
        }
    }

    pub fn estimate(&self) -> Option<&PointEstimate> {
        match self {
            FitOutcome::Converged { estimate, .. } => Some(estimate),
            _ => None,
        }
    }

    pub fn status(&self) -> FitStatus {
        match self {
            FitOutcome::Converged {
                within_tolerance: true,
                ..
            } => FitStatus::Converged,
            FitOutcome::Converged { .. } => FitStatus::Exhausted,
            FitOutcome::Failed { .. } => FitStatus::Failed,
            FitOutcome::Downgraded { .. } => FitStatus::Downgraded,
        }
    }
}
