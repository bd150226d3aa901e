//! Levenberg-Marquardt for small dense least-squares problems.
//!
//! We minimize `Σ r_i(x)^2` for a residual function with `m` outputs and `n`
//! parameters. The Jacobian is taken by forward differences, so every outer
//! iteration costs `n` extra residual evaluations on top of the trial steps.
//!
//! The step solves the damped normal equations
//!
//! ```text
//! (JᵀJ + λ D²) δ = -Jᵀr
//! ```
//!
//! where `D` holds the running maximum of the Jacobian column norms (Marquardt
//! scaling). This keeps parameters of very different magnitude (a noise offset
//! near 1e-9 next to a barrier height near 1) on an equal footing, and keeps
//! the system definite even when `m < n`.
//!
//! Defaults follow MINPACK's `lmdif`:
//! `ftol = xtol = 1.49012e-8`, no gradient test, 2000 evaluations.

use nalgebra::{DMatrix, DVector};

use crate::error::FitError;

/// Damping beyond which no step can improve the cost any more.
const LAMBDA_MAX: f64 = 1e16;
const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_INIT: f64 = 1e-3;

/// Solver tolerances and budget.
#[derive(Debug, Clone, PartialEq)]
pub struct LmOptions {
    /// Relative reduction of the sum of squares considered converged.
    pub ftol: f64,
    /// Relative (scaled) step size considered converged.
    pub xtol: f64,
    /// Residual evaluations allowed, Jacobian columns included.
    pub max_evaluations: usize,
    /// Relative forward-difference step (`sqrt(machine epsilon)` by default).
    pub diff_step: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            ftol: 1.49012e-8,
            xtol: 1.49012e-8,
            max_evaluations: 2000,
            diff_step: f64::EPSILON.sqrt(),
        }
    }
}

/// Why the solver stopped successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    RelativeReduction,
    RelativeStep,
    ZeroResidual,
    /// No improving step exists even at maximal damping.
    Stationary,
}

#[derive(Debug, Clone)]
pub struct LmSolution {
    pub params: Vec<f64>,
    pub residuals: Vec<f64>,
    pub evaluations: usize,
    pub termination: Termination,
}

impl LmSolution {
    pub fn sum_of_squares(&self) -> f64 {
        sum_sq(&self.residuals)
    }
}

/// Minimize the sum of squares of `residual` starting from `initial`.
///
/// `residual(x, out)` must fill all `m` entries of `out`. A non-finite residual
/// aborts the fit with `FitError::NonFiniteResidual`.
pub fn levenberg_marquardt<F>(
    mut residual: F,
    initial: &[f64],
    m: usize,
    options: &LmOptions,
) -> Result<LmSolution, FitError>
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n = initial.len();
    if n == 0 || m == 0 {
        return Err(FitError::EmptySample);
    }

    let mut x = DVector::from_column_slice(initial);
    let mut r = vec![0.0; m];
    let mut evaluations = 0usize;
    evaluate(&mut residual, x.as_slice(), &mut r, &mut evaluations)?;
    let mut cost = sum_sq(&r);

    let mut diag = DVector::<f64>::zeros(n);
    let mut lambda = LAMBDA_INIT;
    let mut trial = vec![0.0; m];

    loop {
        if cost == 0.0 {
            return Ok(solution(x, r, evaluations, Termination::ZeroResidual));
        }

        let jac = forward_jacobian(&mut residual, x.as_slice(), &r, options.diff_step, &mut evaluations)?;
        if evaluations >= options.max_evaluations {
            return Err(FitError::EvaluationBudget(options.max_evaluations));
        }

        for j in 0..n {
            let norm = jac.column(j).norm();
            if norm > diag[j] {
                diag[j] = norm;
            }
            if diag[j] == 0.0 {
                diag[j] = 1.0;
            }
        }

        let rv = DVector::from_column_slice(&r);
        let jtj = jac.tr_mul(&jac);
        let neg_grad = -jac.tr_mul(&rv);

        // Inner loop: raise the damping until a step lowers the cost.
        loop {
            let mut a = jtj.clone();
            for j in 0..n {
                a[(j, j)] += lambda * diag[j] * diag[j];
            }

            let step = match a.cholesky() {
                Some(ch) => ch.solve(&neg_grad),
                None => {
                    lambda *= 10.0;
                    if lambda > LAMBDA_MAX {
                        return Err(FitError::SingularSystem);
                    }
                    continue;
                }
            };
            if step.iter().any(|v| !v.is_finite()) {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    return Err(FitError::SingularSystem);
                }
                continue;
            }

            let candidate = &x + &step;
            evaluate(&mut residual, candidate.as_slice(), &mut trial, &mut evaluations)?;
            let new_cost = sum_sq(&trial);

            let xnorm = diag.component_mul(&x).norm();
            let dnorm = diag.component_mul(&step).norm();

            if new_cost < cost {
                // Predicted reduction of the linearized model, relative to the cost.
                let jd = &jac * &step;
                let predicted = (jd.norm_squared() + 2.0 * lambda * diag.component_mul(&step).norm_squared()) / cost;
                let actual = (cost - new_cost) / cost;

                x = candidate;
                std::mem::swap(&mut r, &mut trial);
                cost = new_cost;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);

                if actual <= options.ftol && predicted <= options.ftol {
                    return Ok(solution(x, r, evaluations, Termination::RelativeReduction));
                }
                if dnorm <= options.xtol * xnorm {
                    return Ok(solution(x, r, evaluations, Termination::RelativeStep));
                }
                if cost == 0.0 {
                    return Ok(solution(x, r, evaluations, Termination::ZeroResidual));
                }
                break;
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX || dnorm <= options.xtol * xnorm {
                return Ok(solution(x, r, evaluations, Termination::Stationary));
            }
            if evaluations >= options.max_evaluations {
                return Err(FitError::EvaluationBudget(options.max_evaluations));
            }
        }

        if evaluations >= options.max_evaluations {
            return Err(FitError::EvaluationBudget(options.max_evaluations));
        }
    }
}

/// Forward-difference Jacobian (`m × n`) at `x`, given the residual `r0` there.
pub fn forward_jacobian<F>(
    residual: &mut F,
    x: &[f64],
    r0: &[f64],
    diff_step: f64,
    evaluations: &mut usize,
) -> Result<DMatrix<f64>, FitError>
where
    F: FnMut(&[f64], &mut [f64]),
{
    let m = r0.len();
    let n = x.len();
    let mut jac = DMatrix::<f64>::zeros(m, n);
    let mut xp = x.to_vec();
    let mut rp = vec![0.0; m];

    for j in 0..n {
        let mut h = diff_step * x[j].abs();
        if h == 0.0 {
            h = diff_step;
        }
        xp[j] = x[j] + h;
        evaluate(residual, &xp, &mut rp, evaluations)?;
        xp[j] = x[j];
        for i in 0..m {
            jac[(i, j)] = (rp[i] - r0[i]) / h;
        }
    }

    Ok(jac)
}

fn evaluate<F>(residual: &mut F, x: &[f64], out: &mut [f64], evaluations: &mut usize) -> Result<(), FitError>
where
    F: FnMut(&[f64], &mut [f64]),
{
    residual(x, out);
    *evaluations += 1;
    if out.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(FitError::NonFiniteResidual)
    }
}

fn solution(x: DVector<f64>, r: Vec<f64>, evaluations: usize, termination: Termination) -> LmSolution {
    LmSolution {
        params: x.iter().copied().collect(),
        residuals: r,
        evaluations,
        termination,
    }
}

pub fn sum_sq(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_exponential_decay() {
        // y = 3 exp(-0.5 t) + 1
        let t: Vec<f64> = (0..30).map(|i| i as f64 * 0.25).collect();
        let y: Vec<f64> = t.iter().map(|t| 3.0 * (-0.5 * t).exp() + 1.0).collect();

        let sol = levenberg_marquardt(
            |p, out| {
                for i in 0..t.len() {
                    out[i] = p[0] * (-p[1] * t[i]).exp() + p[2] - y[i];
                }
            },
            &[1.0, 1.0, 0.0],
            t.len(),
            &LmOptions::default(),
        )
        .unwrap();

        assert!((sol.params[0] - 3.0).abs() < 1e-6, "{:?}", sol.params);
        assert!((sol.params[1] - 0.5).abs() < 1e-6);
        assert!((sol.params[2] - 1.0).abs() < 1e-6);
        assert!(sol.sum_of_squares() < 1e-12);
    }

    #[test]
    fn underdetermined_problem_still_returns_parameters() {
        // One equation, two unknowns: p0 + p1 = 2.
        let sol = levenberg_marquardt(
            |p, out| out[0] = p[0] + p[1] - 2.0,
            &[0.0, 0.0],
            1,
            &LmOptions::default(),
        )
        .unwrap();
        assert!((sol.params[0] + sol.params[1] - 2.0).abs() < 1e-8);
    }

    #[test]
    fn non_finite_residual_is_an_error() {
        let err = levenberg_marquardt(
            |p, out| out[0] = 1.0 / (p[0] - 1.0),
            &[1.0],
            1,
            &LmOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err, FitError::NonFiniteResidual);
    }

    #[test]
    fn budget_is_enforced() {
        let options = LmOptions {
            max_evaluations: 3,
            ..LmOptions::default()
        };
        let err = levenberg_marquardt(
            |p, out| {
                out[0] = p[0].sin() - 0.3;
                out[1] = p[1].cos() - 0.2;
                out[2] = p[0] * p[1] - 1.0;
            },
            &[5.0, 5.0],
            3,
            &options,
        )
        .unwrap_err();
        assert_eq!(err, FitError::EvaluationBudget(3));
    }

    #[test]
    fn empty_problem_is_rejected() {
        let err = levenberg_marquardt(|_, _| {}, &[1.0], 0, &LmOptions::default()).unwrap_err();
        assert_eq!(err, FitError::EmptySample);
    }
}
