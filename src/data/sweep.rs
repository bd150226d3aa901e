//! One recorded BEEM spectrum.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::{BiasWindow, Direction, SpatialFitKey};
use crate::error::AppError;

/// A single bias sweep at one tip position.
///
/// The measurement arrays are immutable once the sweep enters a grid; the
/// grid only fills in `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub bias: Vec<f64>,
    pub i_tunnel: Vec<f64>,
    pub i_beem: Vec<f64>,
    /// Tip height during the sweep.
    pub pos_z: Vec<f64>,

    pub pos_x: f64,
    pub pos_y: f64,
    pub sweep_number: u32,
    pub direction: Direction,
    pub acquired_at: Option<NaiveDateTime>,
    pub sample: Option<String>,
    pub device: Option<String>,
    /// Where the sweep came from (file name, generator tag).
    pub source: Option<String>,

    /// Assigned by `Grid::new`.
    pub key: Option<SpatialFitKey>,
}

impl Sweep {
    /// A sweep at `(pos_x, pos_y)` with no metadata.
    pub fn new(
        bias: Vec<f64>,
        i_tunnel: Vec<f64>,
        i_beem: Vec<f64>,
        pos_z: Vec<f64>,
        pos_x: f64,
        pos_y: f64,
    ) -> Self {
        Self {
            bias,
            i_tunnel,
            i_beem,
            pos_z,
            pos_x,
            pos_y,
            sweep_number: 0,
            direction: Direction::Forward,
            acquired_at: None,
            sample: None,
            device: None,
            source: None,
            key: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bias.is_empty()
    }

    /// Reject empty sweeps, ragged arrays, non-finite positions and a bias
    /// that does not span a range (one sample, constant or all non-finite).
    pub fn validate(&self) -> Result<(), AppError> {
        if self.bias.is_empty() {
            return Err(AppError::new(3, format!("Sweep {} has no samples.", self.label())));
        }
        let n = self.bias.len();
        for (name, len) in [
            ("i_tunnel", self.i_tunnel.len()),
            ("i_beem", self.i_beem.len()),
            ("pos_z", self.pos_z.len()),
        ] {
            if len != n {
                return Err(AppError::new(
                    3,
                    format!("Sweep {}: {name} has {len} samples, bias has {n}.", self.label()),
                ));
            }
        }
        if !(self.pos_x.is_finite() && self.pos_y.is_finite()) {
            return Err(AppError::new(3, format!("Sweep {} has a non-finite position.", self.label())));
        }
        if BiasWindow::spanning(&self.bias).is_none() {
            return Err(AppError::new(3, format!("Sweep {}: bias does not span a range.", self.label())));
        }
        Ok(())
    }

    fn label(&self) -> String {
        match &self.source {
            Some(src) => format!("'{src}'"),
            None => format!(
                "at ({:.3}, {:.3}) #{} {}",
                self.pos_x,
                self.pos_y,
                self.sweep_number,
                self.direction.display_name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_ragged_arrays() {
        let mut s = Sweep::new(vec![-1.0, -0.5], vec![1.0, 1.0], vec![0.0, 0.0], vec![0.0, 0.0], 0.0, 0.0);
        assert!(s.validate().is_ok());

        s.i_beem.pop();
        let err = s.validate().unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("i_beem"));
    }

    #[test]
    fn validate_rejects_empty_sweep() {
        let s = Sweep::new(vec![], vec![], vec![], vec![], 0.0, 0.0);
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_degenerate_bias() {
        let single = Sweep::new(vec![-1.0], vec![1.0], vec![0.0], vec![0.0], 0.0, 0.0);
        let err = single.validate().unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("does not span a range"));

        let flat = Sweep::new(vec![-1.0; 3], vec![1.0; 3], vec![0.0; 3], vec![0.0; 3], 0.0, 0.0);
        assert!(flat.validate().is_err());
    }
}
