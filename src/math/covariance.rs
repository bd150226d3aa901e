//! Parameter covariance from a least-squares Jacobian.
//!
//! For a converged fit with Jacobian `J` (`m × p`) the unscaled covariance is
//! `(JᵀJ)⁻¹`. Multiplying by the reduced chi-square `Σr² / (m - p)` gives the
//! usual estimate of the parameter covariance.
//!
//! Implementation choices:
//! - Columns are scaled to unit norm before forming the normal matrix, so the
//!   Cholesky factorization sees a well-conditioned problem even when the raw
//!   parameters differ by ten orders of magnitude.
//! - A zero column or a failed factorization means a parameter the data does
//!   not constrain; we report that as "no covariance" rather than inventing one.

use nalgebra::DMatrix;

const MIN_PIVOT: f64 = 1e-13;

/// `(JᵀJ)⁻¹`, or `None` when the normal matrix is singular.
pub fn unscaled_covariance(jac: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let p = jac.ncols();
    if p == 0 || jac.nrows() < p {
        return None;
    }

    let mut scale = Vec::with_capacity(p);
    for j in 0..p {
        let norm = jac.column(j).norm();
        if !(norm.is_finite() && norm > 0.0) {
            return None;
        }
        scale.push(1.0 / norm);
    }

    let mut scaled = jac.clone();
    for (j, s) in scale.iter().enumerate() {
        scaled.column_mut(j).scale_mut(*s);
    }

    // Unit-diagonal normal matrix: a tiny pivot means numerically collinear columns.
    let normal = scaled.tr_mul(&scaled);
    let chol = normal.cholesky()?;
    if chol.l().diagonal().iter().any(|d| d * d < MIN_PIVOT) {
        return None;
    }
    let inv = chol.inverse();

    let mut cov = inv;
    for i in 0..p {
        for j in 0..p {
            cov[(i, j)] *= scale[i] * scale[j];
        }
    }

    if cov.iter().all(|v| v.is_finite()) {
        Some(cov)
    } else {
        None
    }
}

/// Square roots of the covariance diagonal; `+∞` where unavailable.
///
/// A missing covariance, or a negative / non-finite variance, marks the
/// parameter as not identifiable from the data.
pub fn standard_errors(cov: Option<&DMatrix<f64>>, p: usize) -> Vec<f64> {
    match cov {
        Some(cov) => (0..p)
            .map(|i| {
                let var = cov[(i, i)];
                if var.is_finite() && var >= 0.0 {
                    var.sqrt()
                } else {
                    f64::INFINITY
                }
            })
            .collect(),
        None => vec![f64::INFINITY; p],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covariance_of_straight_line_fit() {
        // Design for y = b0 + b1 x on x = [0, 1, 2].
        let j = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let cov = unscaled_covariance(&j).unwrap();
        // (XᵀX)⁻¹ = [[5/6, -1/2], [-1/2, 1/2]]
        assert!((cov[(0, 0)] - 5.0 / 6.0).abs() < 1e-12);
        assert!((cov[(0, 1)] + 0.5).abs() < 1e-12);
        assert!((cov[(1, 1)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn badly_scaled_columns_are_handled() {
        let j = DMatrix::from_row_slice(3, 2, &[1e-9, 0.0, 1e-9, 1e6, 1e-9, 2e6]);
        let cov = unscaled_covariance(&j).unwrap();
        assert!((cov[(0, 0)] - 5.0 / 6.0 * 1e18).abs() / 1e18 < 1e-9);
        assert!((cov[(1, 1)] - 0.5e-12).abs() / 1e-12 < 1e-9);
    }

    #[test]
    fn zero_column_has_no_covariance() {
        let j = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        assert!(unscaled_covariance(&j).is_none());
        let errs = standard_errors(None, 2);
        assert!(errs.iter().all(|e| e.is_infinite()));
    }

    #[test]
    fn collinear_columns_have_no_covariance() {
        let j = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        assert!(unscaled_covariance(&j).is_none());
    }
}
