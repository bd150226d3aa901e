/// Application-level error: a process exit code plus a human-readable message.
///
/// Exit codes:
/// - `2`: bad input (CLI arguments, unreadable or malformed files)
/// - `3`: invalid grid data (empty grid, inconsistent sweeps)
/// - `4`: runtime failure (worker pool, export)
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

/// Numerical failure inside the fitting core.
///
/// These never leave a `PointFit`: the search converts them into a
/// `FitOutcome` so a single bad curve cannot abort a grid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitError {
    #[error("no samples inside the fit window")]
    EmptySample,
    #[error("bias has {bias} samples but current has {current}")]
    LengthMismatch { bias: usize, current: usize },
    #[error("parameter vector of length {0} is not [offset, φ.., a..]")]
    InvalidParameters(usize),
    #[error("model produced a non-finite residual")]
    NonFiniteResidual,
    #[error("damped normal equations are singular")]
    SingularSystem,
    #[error("evaluation budget of {0} exhausted before convergence")]
    EvaluationBudget(usize),
    #[error("invalid bias window [{min}, {max}]")]
    InvalidWindow { min: String, max: String },
}

impl FitError {
    pub fn invalid_window(min: f64, max: f64) -> Self {
        Self::InvalidWindow {
            min: format!("{min:.4}"),
            max: format!("{max:.4}"),
        }
    }
}
