//! Detection parameters.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{Band, error::ConfigError, fit::MAX_HARMONICS};

/// How many detection bands must be out of bounds before an observation counts as anomalous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandVote {
    /// Absolute amount of bands.
    Count(usize),
    /// Fraction of the detection bands, rounded up.
    Fraction(f64),
}

impl BandVote {
    /// Resolve to an amount of bands for a detection band set.
    #[must_use]
    pub fn required(self, detection_bands: usize) -> usize {
        match self {
            Self::Count(count) => count,
            #[allow(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::cast_precision_loss
            )]
            Self::Fraction(fraction) => (fraction * detection_bands as f64).ceil() as usize,
        }
    }
}

impl Default for BandVote {
    fn default() -> Self {
        Self::Fraction(0.5)
    }
}

/// Immutable parameters of a detection run.
///
/// # Defaults
///
/// - `algorithm`: `"ccd-rs:<crate version>"`
/// - `minimum_segment_length`: `12`
/// - `minimum_window_days`: `365`
/// - `confirmation_window`: `6`
/// - `residual_threshold`: `4.0`
/// - `band_vote`: [`BandVote::Fraction`] of `0.5`
/// - `regularization`: `0.1`
/// - `max_iterations`: `1000`
/// - `tolerance`: `1e-4`
/// - `harmonic_order`: `3`
/// - `observation_factor`: `3`
/// - `minimum_rmse`: `1.0`
/// - `ridge`: `1e-6`
/// - `bands`: every [`Band`]
/// - `detection_bands`: green, red, nir, swir1, swir2
/// - `reflectance_range`: `[0, 10000]`
/// - `thermal_range`: `[-9320, 7070]`
/// - `cloud_threshold`, `snow_threshold`: `0.5`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Parameters {
    /// Version tag copied into every result.
    pub algorithm: String,
    /// Minimum amount of observations in a segment.
    pub minimum_segment_length: usize,
    /// Minimum span in days of an initialization window.
    pub minimum_window_days: i64,
    /// Consecutive anomalies needed to confirm a break.
    pub confirmation_window: usize,
    /// Residual bound, as a multiple of the band's comparison scale.
    pub residual_threshold: f64,
    /// Bands needed to flag an observation.
    pub band_vote: BandVote,
    /// L1 regularization strength.
    ///
    /// Harmonic coefficients shrink by about twice this value, keep it below half of
    /// `minimum_rmse` for an exact curve to be reproduced.
    pub regularization: f64,
    /// Coordinate descent sweep cap.
    pub max_iterations: usize,
    /// Relative coefficient change at which coordinate descent stops.
    pub tolerance: f64,
    /// Highest harmonic fitted.
    pub harmonic_order: usize,
    /// Observations required per coefficient before a higher order is used.
    pub observation_factor: usize,
    /// Lower bound of the comparison scale.
    pub minimum_rmse: f64,
    /// Relative diagonal load when the normal equations are singular.
    pub ridge: f64,
    /// Bands that are fitted and reported.
    pub bands: Vec<Band>,
    /// Bands that vote on breaks.
    pub detection_bands: Vec<Band>,
    /// Valid range of the reflective bands.
    pub reflectance_range: [f64; 2],
    /// Valid range of the thermal band.
    pub thermal_range: [f64; 2],
    /// Cloud probability above which an observation is masked.
    pub cloud_threshold: f64,
    /// Snow probability above which an observation is masked.
    pub snow_threshold: f64,
}

impl Parameters {
    /// Construct parameters with the default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            algorithm: concat!("ccd-rs:", env!("CARGO_PKG_VERSION")).to_owned(),
            minimum_segment_length: 12,
            minimum_window_days: 365,
            confirmation_window: 6,
            residual_threshold: 4.0,
            band_vote: BandVote::default(),
            regularization: 0.1,
            max_iterations: 1000,
            tolerance: 1e-4,
            harmonic_order: MAX_HARMONICS,
            observation_factor: 3,
            minimum_rmse: 1.0,
            ridge: 1e-6,
            bands: Band::ALL.to_vec(),
            detection_bands: vec![Band::Green, Band::Red, Band::Nir, Band::Swir1, Band::Swir2],
            reflectance_range: [0.0, 10_000.0],
            thermal_range: [-9320.0, 7070.0],
            cloud_threshold: 0.5,
            snow_threshold: 0.5,
        }
    }

    /// Parse and validate parameters from a TOML document.
    ///
    /// Missing keys keep their default value.
    ///
    /// # Errors
    ///
    /// - When the document can't be parsed.
    /// - When a value is invalid.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let parameters: Self = toml::from_str(document)?;
        parameters.validate()?;

        Ok(parameters)
    }

    /// Read, parse and validate parameters from a TOML file.
    ///
    /// # Errors
    ///
    /// - When the file can't be read.
    /// - When the document can't be parsed.
    /// - When a value is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let document = fs::read_to_string(path)?;

        Self::from_toml_str(&document)
    }

    /// Set the minimum segment length.
    #[must_use]
    pub const fn with_minimum_segment_length(mut self, minimum_segment_length: usize) -> Self {
        self.minimum_segment_length = minimum_segment_length;

        self
    }

    /// Set the minimum span of an initialization window.
    #[must_use]
    pub const fn with_minimum_window_days(mut self, days: i64) -> Self {
        self.minimum_window_days = days;

        self
    }

    /// Set the amount of consecutive anomalies confirming a break.
    #[must_use]
    pub const fn with_confirmation_window(mut self, confirmation_window: usize) -> Self {
        self.confirmation_window = confirmation_window;

        self
    }

    /// Set the residual threshold multiplier.
    #[must_use]
    pub const fn with_residual_threshold(mut self, residual_threshold: f64) -> Self {
        self.residual_threshold = residual_threshold;

        self
    }

    /// Set the cross-band vote.
    #[must_use]
    pub const fn with_band_vote(mut self, band_vote: BandVote) -> Self {
        self.band_vote = band_vote;

        self
    }

    /// Set the L1 regularization strength.
    #[must_use]
    pub const fn with_regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;

        self
    }

    /// Set the coordinate descent sweep cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;

        self
    }

    /// Set the highest harmonic fitted.
    #[must_use]
    pub const fn with_harmonic_order(mut self, harmonic_order: usize) -> Self {
        self.harmonic_order = harmonic_order;

        self
    }

    /// Set the lower bound of the comparison scale.
    #[must_use]
    pub const fn with_minimum_rmse(mut self, minimum_rmse: f64) -> Self {
        self.minimum_rmse = minimum_rmse;

        self
    }

    /// Set the fitted and reported bands.
    #[must_use]
    pub fn with_bands(mut self, bands: impl Into<Vec<Band>>) -> Self {
        self.bands = bands.into();

        self
    }

    /// Set the bands voting on breaks.
    #[must_use]
    pub fn with_detection_bands(mut self, bands: impl Into<Vec<Band>>) -> Self {
        self.detection_bands = bands.into();

        self
    }

    /// Set the version tag reported in results.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();

        self
    }

    /// Amount of detection bands needed to flag an observation.
    #[must_use]
    pub fn required_votes(&self) -> usize {
        self.band_vote.required(self.detection_bands.len())
    }

    /// Valid range of a band.
    pub(crate) const fn range(&self, band: Band) -> [f64; 2] {
        match band {
            Band::Thermal => self.thermal_range,
            _ => self.reflectance_range,
        }
    }

    /// Check every value.
    ///
    /// # Errors
    ///
    /// - When a value is out of its valid domain.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.algorithm.is_empty() {
            return Err(ConfigError::invalid("algorithm", "must not be empty"));
        }
        if self.bands.is_empty() {
            return Err(ConfigError::invalid("bands", "at least one band is required"));
        }
        if has_duplicates(&self.bands) {
            return Err(ConfigError::invalid("bands", "bands must be unique"));
        }
        if self.detection_bands.is_empty() {
            return Err(ConfigError::invalid(
                "detection_bands",
                "at least one band is required",
            ));
        }
        if has_duplicates(&self.detection_bands) {
            return Err(ConfigError::invalid(
                "detection_bands",
                "bands must be unique",
            ));
        }
        if let Some(band) = self
            .detection_bands
            .iter()
            .find(|band| !self.bands.contains(band))
        {
            return Err(ConfigError::invalid(
                "detection_bands",
                format!("'{band}' is not one of the fitted bands"),
            ));
        }
        if !(1..=MAX_HARMONICS).contains(&self.harmonic_order) {
            return Err(ConfigError::invalid(
                "harmonic_order",
                format!("must be between 1 and {MAX_HARMONICS}"),
            ));
        }
        let lowest = crate::fit::coefficient_count(1);
        if self.minimum_segment_length < lowest {
            return Err(ConfigError::invalid(
                "minimum_segment_length",
                format!("must be at least {lowest}, the smallest model's coefficient count"),
            ));
        }
        if self.minimum_window_days < 0 {
            return Err(ConfigError::invalid(
                "minimum_window_days",
                "must not be negative",
            ));
        }
        if self.confirmation_window == 0 {
            return Err(ConfigError::invalid(
                "confirmation_window",
                "must be positive",
            ));
        }
        if !(self.residual_threshold.is_finite() && self.residual_threshold > 0.0) {
            return Err(ConfigError::invalid(
                "residual_threshold",
                "must be a positive number",
            ));
        }
        let votes = self.required_votes();
        if votes == 0 || votes > self.detection_bands.len() {
            return Err(ConfigError::invalid(
                "band_vote",
                format!(
                    "resolves to {votes} of {} detection bands",
                    self.detection_bands.len()
                ),
            ));
        }
        if !(self.regularization.is_finite() && self.regularization >= 0.0) {
            return Err(ConfigError::invalid(
                "regularization",
                "must be a non-negative number",
            ));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", "must be positive"));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::invalid(
                "tolerance",
                "must be a positive number",
            ));
        }
        if self.observation_factor == 0 {
            return Err(ConfigError::invalid(
                "observation_factor",
                "must be positive",
            ));
        }
        if !(self.minimum_rmse.is_finite() && self.minimum_rmse > 0.0) {
            return Err(ConfigError::invalid(
                "minimum_rmse",
                "must be a positive number",
            ));
        }
        if !(self.ridge.is_finite() && self.ridge > 0.0) {
            return Err(ConfigError::invalid("ridge", "must be a positive number"));
        }
        for (name, [low, high]) in [
            ("reflectance_range", self.reflectance_range),
            ("thermal_range", self.thermal_range),
        ] {
            if !(low.is_finite() && high.is_finite() && low <= high) {
                return Err(ConfigError::invalid(name, "must be a finite [low, high] pair"));
            }
        }
        for (name, threshold) in [
            ("cloud_threshold", self.cloud_threshold),
            ("snow_threshold", self.snow_threshold),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::invalid(name, "must be a probability"));
            }
        }

        Ok(())
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a band list names a band twice.
fn has_duplicates(bands: &[Band]) -> bool {
    bands
        .iter()
        .enumerate()
        .any(|(index, band)| bands[..index].contains(band))
}
