//! Schottky diode fit of a macroscopic I-V curve.
//!
//! Thermionic emission over the barrier with ideality factor `n`:
//!
//! ```text
//! I = Is · exp(-φ/kT + V/(n·kT)) · (1 - exp(-V/kT)),   Is = A** · W · T²
//! ```
//!
//! The fit is done on `ln|I|` so that currents spanning many decades weigh
//! equally. Only samples strictly inside the voltage window are used; the
//! model vanishes at `V = 0`, so the window should not contain it.

use serde::{Deserialize, Serialize};

use crate::domain::BiasWindow;
use crate::error::FitError;
use crate::math::{
    LmOptions, forward_jacobian, levenberg_marquardt, r_squared, standard_errors, sum_sq, unscaled_covariance,
};

/// Boltzmann constant in eV/K.
const BOLTZMANN_EV: f64 = 8.617_333_262e-5;

/// Starting `[φ, n]` of an I-V fit.
pub const DEFAULT_IV_GUESS: [f64; 2] = [0.8, 1.0];

/// Diode geometry and temperature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diode {
    /// Kelvin.
    pub temperature: f64,
    /// Effective Richardson constant, A·m⁻²·K⁻².
    pub richardson: f64,
    /// Contact area, m².
    pub area: f64,
}

impl Default for Diode {
    fn default() -> Self {
        Self {
            temperature: 300.0,
            richardson: 1.1e6,
            area: std::f64::consts::PI * 2.5e-4 * 2.5e-4,
        }
    }
}

impl Diode {
    /// `kT` in eV.
    pub fn thermal_voltage(&self) -> f64 {
        BOLTZMANN_EV * self.temperature
    }

    pub fn saturation_current(&self) -> f64 {
        self.richardson * self.area * self.temperature * self.temperature
    }

    pub fn current(&self, voltage: f64, barrier_height: f64, ideality: f64) -> f64 {
        let kt = self.thermal_voltage();
        self.saturation_current()
            * (-barrier_height / kt + voltage / (ideality * kt)).exp()
            * (1.0 - (-voltage / kt).exp())
    }

    /// `ln|I|`; the expression is expanded so huge exponents do not overflow.
    pub fn log_current(&self, voltage: f64, barrier_height: f64, ideality: f64) -> f64 {
        let kt = self.thermal_voltage();
        self.saturation_current().ln() - barrier_height / kt
            + voltage / (ideality * kt)
            + (-(-voltage / kt).exp_m1()).abs().ln()
    }
}

/// Barrier height and ideality of a fitted I-V curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvEstimate {
    pub barrier_height: f64,
    pub ideality: f64,
    pub barrier_height_err: f64,
    pub ideality_err: f64,
    /// Of `ln|I|` over the window.
    pub r_squared: Option<f64>,
    pub samples: usize,
}

/// Fit `diode` to `(voltage, current)` inside `window`, starting from `initial = [φ, n]`.
pub fn fit_iv(
    diode: &Diode,
    voltage: &[f64],
    current: &[f64],
    window: &BiasWindow,
    initial: [f64; 2],
    options: &LmOptions,
) -> Result<IvEstimate, FitError> {
    if voltage.len() != current.len() {
        return Err(FitError::LengthMismatch {
            bias: voltage.len(),
            current: current.len(),
        });
    }

    let (v, log_i): (Vec<f64>, Vec<f64>) = voltage
        .iter()
        .zip(current)
        .filter(|(v, _)| **v > window.min() && **v < window.max())
        .map(|(v, i)| (*v, i.abs().ln()))
        .unzip();
    if v.is_empty() {
        return Err(FitError::EmptySample);
    }
    if log_i.iter().any(|y| !y.is_finite()) {
        return Err(FitError::NonFiniteResidual);
    }

    let mut residual = |x: &[f64], out: &mut [f64]| {
        for ((o, &vi), &yi) in out.iter_mut().zip(&v).zip(&log_i) {
            *o = diode.log_current(vi, x[0], x[1]) - yi;
        }
    };
    let solution = levenberg_marquardt(&mut residual, &initial, v.len(), options)?;

    let m = v.len();
    let covariance = if m > 2 {
        let mut extra = 0usize;
        forward_jacobian(&mut residual, &solution.params, &solution.residuals, options.diff_step, &mut extra)
            .ok()
            .and_then(|jac| unscaled_covariance(&jac))
            .map(|cov| cov * (sum_sq(&solution.residuals) / (m - 2) as f64))
    } else {
        None
    };
    let errors = standard_errors(covariance.as_ref(), 2);

    let (barrier_height, ideality) = (solution.params[0], solution.params[1]);
    let estimated: Vec<f64> = v
        .iter()
        .map(|&vi| diode.log_current(vi, barrier_height, ideality))
        .collect();

    let estimate = IvEstimate {
        barrier_height,
        ideality,
        barrier_height_err: errors[0],
        ideality_err: errors[1],
        r_squared: r_squared(&log_i, &estimated),
        samples: m,
    };
    tracing::debug!(
        phi = estimate.barrier_height,
        ideality = estimate.ideality,
        samples = m,
        evaluations = solution.evaluations,
        "I-V fit"
    );
    Ok(estimate)
}
