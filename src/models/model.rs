//! Bell-Kaiser emission law with inverse-bias correction.
//!
//! ```text
//! I(V) = offset + Σ_i  -a_i * |V - φ_i|^n / V      for V beyond φ_i
//! ```
//!
//! Parameters are packed as `[offset, φ_1..φ_k, a_1..a_k]`, so `k = (len - 1) / 2`.
//! A barrier is only "turned on" for samples past its threshold, where "past"
//! follows the polarity of the sweep: `V < φ` for predominantly negative bias,
//! `V > φ` otherwise.
//!
//! Two backends implement the same law:
//! - `Reference`: one masked pass per barrier, `powf` for the exponent
//! - `Fast`: a single fused pass over samples, `k * k` when `n == 2`
//!
//! They agree up to floating-point rounding; the fitter does not care which
//! one it is given.

use serde::{Deserialize, Serialize};

/// Samples with `|V|` below this never receive a barrier contribution.
///
/// The `1/V` factor diverges at zero bias; rather than rely on the data never
/// getting there, such samples keep only the offset.
pub const MIN_ABS_BIAS: f64 = 1e-6;

/// Evaluation strategy for the emission law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Reference,
    Fast,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reference" | "ref" => Some(Backend::Reference),
            "fast" | "native" => Some(Backend::Fast),
            _ => None,
        }
    }
}

/// Sign convention of a bias series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Negative,
    Positive,
}

impl Polarity {
    /// Majority sign of the samples; ties go to the sign of the first sample.
    pub fn of(bias: &[f64]) -> Self {
        let mut negative = 0usize;
        let mut positive = 0usize;
        for &v in bias {
            if v < 0.0 {
                negative += 1;
            } else if v > 0.0 {
                positive += 1;
            }
        }
        if negative > positive || (negative == positive && bias.first().is_some_and(|v| *v < 0.0)) {
            Polarity::Negative
        } else {
            Polarity::Positive
        }
    }

    #[inline]
    fn beyond(self, v: f64, threshold: f64) -> bool {
        match self {
            Polarity::Negative => v < threshold,
            Polarity::Positive => v > threshold,
        }
    }
}

/// Number of barriers encoded in a parameter vector.
pub fn barrier_count(params: &[f64]) -> usize {
    params.len().saturating_sub(1) / 2
}

/// The emission model, carrying its evaluation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmissionModel {
    backend: Backend,
}

impl EmissionModel {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Evaluate the model at every bias sample.
    ///
    /// # Panics
    /// Panics if `params` is empty (the offset is mandatory).
    pub fn evaluate(&self, bias: &[f64], order: f64, params: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; bias.len()];
        self.evaluate_into(bias, order, params, &mut out);
        out
    }

    /// Evaluate into a caller-owned buffer of the same length as `bias`.
    ///
    /// # Panics
    /// Panics if `params` is empty or `out.len() != bias.len()`.
    pub fn evaluate_into(&self, bias: &[f64], order: f64, params: &[f64], out: &mut [f64]) {
        assert_eq!(out.len(), bias.len(), "output buffer must match bias length");
        match self.backend {
            Backend::Reference => reference(bias, order, params, out),
            Backend::Fast => fast(bias, order, params, out),
        }
    }

    /// `evaluate(bias, order, params) - observed`.
    pub fn residual(&self, params: &[f64], bias: &[f64], observed: &[f64], order: f64) -> Vec<f64> {
        let mut out = vec![0.0; bias.len()];
        self.residual_into(params, bias, observed, order, &mut out);
        out
    }

    /// Residual into a caller-owned buffer; this is the least-squares objective.
    pub fn residual_into(
        &self,
        params: &[f64],
        bias: &[f64],
        observed: &[f64],
        order: f64,
        out: &mut [f64],
    ) {
        self.evaluate_into(bias, order, params, out);
        for (r, y) in out.iter_mut().zip(observed) {
            *r -= y;
        }
    }
}

fn reference(bias: &[f64], order: f64, params: &[f64], out: &mut [f64]) {
    let offset = params[0];
    let k = barrier_count(params);
    let polarity = Polarity::of(bias);

    out.fill(offset);

    let barriers = &params[1..1 + k];
    let coefficients = &params[1 + k..1 + 2 * k];
    for (&phi, &a) in barriers.iter().zip(coefficients) {
        for (i, &v) in bias.iter().enumerate() {
            if polarity.beyond(v, phi) && v.abs() >= MIN_ABS_BIAS {
                out[i] += -a * (v - phi).abs().powf(order) / v;
            }
        }
    }
}

fn fast(bias: &[f64], order: f64, params: &[f64], out: &mut [f64]) {
    let offset = params[0];
    let k = barrier_count(params);
    let (barriers, coefficients) = params[1..1 + 2 * k].split_at(k);
    let negative = Polarity::of(bias) == Polarity::Negative;
    let square = order == 2.0;

    for (slot, &v) in out.iter_mut().zip(bias) {
        let mut acc = offset;
        if v.abs() >= MIN_ABS_BIAS {
            for j in 0..k {
                let phi = barriers[j];
                let on = if negative { v < phi } else { v > phi };
                if on {
                    let d = v - phi;
                    let p = if square { d * d } else { d.abs().powf(order) };
                    acc -= coefficients[j] * p / v;
                }
            }
        }
        *slot = acc;
    }
}
