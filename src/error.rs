//! Error types.

use crate::Band;

/// Errors that can occur during detection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The observations can't be used.
    #[error(transparent)]
    Input(#[from] InputError),
    /// A curve couldn't be fitted, even after falling back.
    #[error(transparent)]
    Fit(#[from] FitError),
    /// The parameters are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Malformed or insufficient observations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// No observations at all.
    #[error("no observations supplied")]
    Empty,
    /// Not enough observations survived masking.
    #[error("not enough valid observations: need at least {needed}, got {got}")]
    NotEnoughObservations {
        /// Minimum segment length.
        needed: usize,
        /// Observations left after masking.
        got: usize,
    },
    /// A configured band has no finite value.
    #[error("observation on day {day} is missing band '{band}'")]
    MissingBand {
        /// Day of the observation.
        day: i64,
        /// Band without a value.
        band: Band,
    },
    /// Days and values of a band run differ in length.
    #[error("{days} days but {values} values")]
    LengthMismatch {
        /// Amount of days.
        days: usize,
        /// Amount of values.
        values: usize,
    },
    /// A classifier probability is not a finite value in `[0, 1]`.
    #[error("observation on day {day} has an ancillary probability outside [0, 1]")]
    InvalidProbability {
        /// Day of the observation.
        day: i64,
    },
}

/// Curve fitting failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FitError {
    /// Fewer observations than coefficients.
    #[error("{observations} observations can't determine {coefficients} coefficients")]
    Underdetermined {
        /// Observations in the run.
        observations: usize,
        /// Coefficients required by the lowest order model.
        coefficients: usize,
    },
    /// The normal equations stayed singular after every fallback.
    #[error("design matrix is singular even with ridge stabilization")]
    Singular,
}

/// Invalid or unreadable parameters.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A parameter has an unusable value.
    #[error("invalid parameter '{name}': {reason}")]
    Invalid {
        /// Parameter name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// The document isn't valid TOML or doesn't match the parameter names.
    #[error("can't parse parameters: {0}")]
    Parse(#[from] toml::de::Error),
    /// The parameter file couldn't be read.
    #[error("can't read parameters: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Shorthand for [`Self::Invalid`].
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            reason: reason.into(),
        }
    }
}
