//! Continuous change detection for multispectral reflectance time series.
//!
//! A single location's observations are masked, then segmented into stable
//! regimes. Each regime is summarized by a regularized harmonic regression per
//! spectral band and closed by a break once enough consecutive observations
//! disagree with its curves across enough bands.
//!
//! ```no_run
//! use ccd::{Band, Observation, Parameters, Quality};
//!
//! let observations = (0..100).map(|index| {
//!     Observation::new(726_468 + 16 * index, Quality::Clear).with_bands([500.0; Band::COUNT])
//! });
//!
//! let result = ccd::detect(observations, &Parameters::default())?;
//! for model in &result.change_models {
//!     println!("{} - {}: {} observations", model.start_day, model.end_day, model.observation_count);
//! }
//! # Ok::<(), ccd::Error>(())
//! ```

mod detect;
mod error;
mod fit;
mod mask;
mod observation;
mod params;
mod result;

use crate::fit::Design;

pub use detect::{Detector, State, Tally};
pub use error::{ConfigError, Error, FitError, InputError};
pub use fit::{
    ANGULAR_FREQUENCY, AVERAGE_DAYS_PER_YEAR, BandFit, COEFFICIENTS, MAX_HARMONICS,
    coefficient_count, harmonics_for,
};
pub use mask::{Preprocessed, preprocess};
pub use observation::{Ancillary, Band, Observation, Quality};
pub use params::{BandVote, Parameters};
pub use result::{BandModel, ChangeModel, CurveQa, DetectionResult};

/// Detect changes in the time series of a single location.
///
/// The parameters are validated before any observation is looked at.
///
/// # Errors
///
/// - When the parameters are invalid.
/// - When an observation is malformed.
/// - When too few observations are usable.
pub fn detect(
    observations: impl IntoIterator<Item = Observation>,
    parameters: &Parameters,
) -> Result<DetectionResult, Error> {
    parameters.validate()?;

    let preprocessed = preprocess(observations, parameters)?;
    tracing::info!(
        observations = preprocessed.observations().len(),
        usable = preprocessed.usable().count(),
        "detecting changes"
    );

    let change_models = Detector::new(&preprocessed, parameters).run();
    tracing::info!(models = change_models.len(), "detection finished");

    let (cloud_prob, snow_prob, water_prob) = preprocessed.probabilities();

    Ok(DetectionResult {
        algorithm: parameters.algorithm.clone(),
        change_models,
        processing_mask: preprocessed.into_mask(),
        cloud_prob,
        snow_prob,
        water_prob,
    })
}

/// Fit the curve of one band on a run of usable observations.
///
/// The amount of harmonics follows the observation count, capped by the configured order.
///
/// # Errors
///
/// - When days and values differ in length.
/// - When there are fewer observations than the lowest order curve has coefficients.
/// - When the design stays singular after every fallback.
pub fn fit_band(days: &[i64], values: &[f64], parameters: &Parameters) -> Result<BandFit, Error> {
    if days.len() != values.len() {
        return Err(InputError::LengthMismatch {
            days: days.len(),
            values: values.len(),
        }
        .into());
    }

    let design = Design::new(days, harmonics_for(days.len(), parameters), parameters)?;

    Ok(design.fit(values, parameters))
}
