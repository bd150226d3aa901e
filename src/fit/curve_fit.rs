//! One least-squares fit of the emission model to a sample.
//!
//! Given:
//! - bias samples `V_i` and observed BEEM current `I_i`
//! - the emission order `n`
//! - a starting parameter vector `[offset, φ.., a..]`
//!
//! we run Levenberg-Marquardt exactly once and report either the converged
//! parameters with their covariance, or why the attempt failed. Retrying and
//! window selection belong to the auto-range search, not here.

use nalgebra::DMatrix;

use crate::error::FitError;
use crate::fit::outcome::PointEstimate;
use crate::math::{LmOptions, forward_jacobian, levenberg_marquardt, standard_errors, sum_sq, unscaled_covariance};
use crate::models::EmissionModel;

/// Outcome of a single optimization attempt.
#[derive(Debug, Clone)]
pub enum CurveFit {
    Converged {
        params: Vec<f64>,
        /// Scaled by the reduced chi-square; `None` when `m <= p` or `JᵀJ` is singular.
        covariance: Option<DMatrix<f64>>,
        evaluations: usize,
    },
    Failed {
        reason: FitError,
    },
}

impl CurveFit {
    pub fn params(&self) -> Option<&[f64]> {
        match self {
            CurveFit::Converged { params, .. } => Some(params),
            CurveFit::Failed { .. } => None,
        }
    }

    /// Per-parameter standard errors (`+∞` where unavailable).
    pub fn standard_errors(&self) -> Option<Vec<f64>> {
        match self {
            CurveFit::Converged { params, covariance, .. } => {
                Some(standard_errors(covariance.as_ref(), params.len()))
            }
            CurveFit::Failed { .. } => None,
        }
    }

    /// Named view of a converged fit.
    pub fn estimate(&self) -> Option<PointEstimate> {
        let params = self.params()?;
        let errors = self.standard_errors()?;
        PointEstimate::from_params(params, &errors)
    }
}

/// Fit `model` to `(bias, observed)` from `initial`.
pub fn curve_fit(
    model: &EmissionModel,
    initial: &[f64],
    bias: &[f64],
    observed: &[f64],
    order: f64,
    options: &LmOptions,
) -> CurveFit {
    match try_curve_fit(model, initial, bias, observed, order, options) {
        Ok(fit) => fit,
        Err(reason) => CurveFit::Failed { reason },
    }
}

fn try_curve_fit(
    model: &EmissionModel,
    initial: &[f64],
    bias: &[f64],
    observed: &[f64],
    order: f64,
    options: &LmOptions,
) -> Result<CurveFit, FitError> {
    if bias.len() != observed.len() {
        return Err(FitError::LengthMismatch {
            bias: bias.len(),
            current: observed.len(),
        });
    }
    if bias.is_empty() {
        return Err(FitError::EmptySample);
    }
    let p = initial.len();
    if p < 3 || p % 2 == 0 {
        return Err(FitError::InvalidParameters(p));
    }

    let mut residual = |x: &[f64], out: &mut [f64]| model.residual_into(x, bias, observed, order, out);
    let solution = levenberg_marquardt(&mut residual, initial, bias.len(), options)?;

    let m = bias.len();
    let covariance = if m > p {
        let mut extra = 0usize;
        forward_jacobian(
            &mut residual,
            &solution.params,
            &solution.residuals,
            options.diff_step,
            &mut extra,
        )
        .ok()
        .and_then(|jac| unscaled_covariance(&jac))
        .map(|cov| cov * (sum_sq(&solution.residuals) / (m - p) as f64))
    } else {
        None
    };

    Ok(CurveFit::Converged {
        params: solution.params,
        covariance,
        evaluations: solution.evaluations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Backend;

    fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| a + (b - a) * i as f64 / (n as f64 - 1.0)).collect()
    }

    #[test]
    fn recovers_noiseless_parameters() {
        for backend in [Backend::Reference, Backend::Fast] {
            let model = EmissionModel::new(backend);
            let bias = linspace(-1.6, -0.1, 76);
            let truth = [2e-10, -0.82, 1.5e-3];
            let observed = model.evaluate(&bias, 2.0, &truth);

            let fit = curve_fit(&model, &[1e-9, -0.75, 1e-3], &bias, &observed, 2.0, &LmOptions::default());
            let params = fit.params().expect("noiseless fit converges").to_vec();

            assert!((params[1] - truth[1]).abs() / truth[1].abs() < 1e-6, "φ = {}", params[1]);
            assert!((params[2] - truth[2]).abs() / truth[2] < 1e-6, "a = {}", params[2]);
            assert!((params[0] - truth[0]).abs() < 1e-12, "offset = {}", params[0]);

            let errs = fit.standard_errors().unwrap();
            assert!(errs.iter().all(|e| e.is_finite()));
            assert!(errs[1] < 1e-6, "σφ = {}", errs[1]);
        }
    }

    #[test]
    fn recovers_two_barriers() {
        let model = EmissionModel::default();
        let bias = linspace(-2.0, -0.1, 120);
        let truth = [0.0, -0.7, -1.3, 1e-3, 3e-3];
        let observed = model.evaluate(&bias, 2.0, &truth);

        let fit = curve_fit(
            &model,
            &[1e-9, -0.65, -1.25, 1.2e-3, 2.5e-3],
            &bias,
            &observed,
            2.0,
            &LmOptions::default(),
        );
        let e = fit.estimate().unwrap();
        assert!((e.barrier_heights[0] + 0.7).abs() < 1e-6);
        assert!((e.barrier_heights[1] + 1.3).abs() < 1e-6);
    }

    #[test]
    fn fewer_samples_than_parameters_has_no_covariance() {
        let model = EmissionModel::default();
        let bias = [-1.2, -1.0];
        let observed = model.evaluate(&bias, 2.0, &[0.0, -0.8, 1e-3]);

        let fit = curve_fit(&model, &[1e-9, -0.8, 1e-3], &bias, &observed, 2.0, &LmOptions::default());
        match &fit {
            CurveFit::Converged { params, covariance, .. } => {
                assert_eq!(params.len(), 3);
                assert!(covariance.is_none());
            }
            CurveFit::Failed { reason } => panic!("expected parameters, got {reason}"),
        }
        assert!(fit.standard_errors().unwrap().iter().all(|e| e.is_infinite()));
    }

    #[test]
    fn mismatched_lengths_fail() {
        let model = EmissionModel::default();
        let fit = curve_fit(&model, &[0.0, -0.8, 1e-3], &[-1.0, -2.0], &[0.0], 2.0, &LmOptions::default());
        assert!(matches!(
            fit,
            CurveFit::Failed {
                reason: FitError::LengthMismatch { bias: 2, current: 1 }
            }
        ));
    }

    #[test]
    fn empty_window_fails() {
        let model = EmissionModel::default();
        let fit = curve_fit(&model, &[0.0, -0.8, 1e-3], &[], &[], 2.0, &LmOptions::default());
        assert!(matches!(fit, CurveFit::Failed { reason: FitError::EmptySample }));
    }

    #[test]
    fn overflow_is_reported_not_raised() {
        let model = EmissionModel::default();
        let bias = linspace(-2.0, -0.5, 20);
        let observed = vec![0.0; bias.len()];
        // An absurd exponent overflows `powf` to infinity.
        let fit = curve_fit(&model, &[0.0, -0.1, 1.0], &bias, &observed, 5000.0, &LmOptions::default());
        assert!(matches!(fit, CurveFit::Failed { reason: FitError::NonFiniteResidual }));
    }
}
