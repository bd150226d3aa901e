//! Small descriptive statistics used by aggregation and goodness of fit.

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Median of a scratch buffer (reordered in place).
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Coefficient of determination `1 - SSE / SST`.
///
/// Returns `None` when the inputs differ in length, are empty, or the sampled
/// values have no spread (SST of zero makes the ratio meaningless).
pub fn r_squared(sampled: &[f64], estimated: &[f64]) -> Option<f64> {
    if sampled.len() != estimated.len() {
        return None;
    }
    let m = mean(sampled)?;
    let sse: f64 = sampled.iter().zip(estimated).map(|(y, f)| (y - f) * (y - f)).sum();
    let sst: f64 = sampled.iter().map(|y| (y - m) * (y - m)).sum();
    if !(sst.is_finite() && sst > 0.0) {
        return None;
    }
    let r2 = 1.0 - sse / sst;
    r2.is_finite().then_some(r2)
}
