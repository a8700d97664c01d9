//! Ordering, deduplication and masking of raw observations.

use accurate::{sum::Kahan, traits::SumAccumulator as _};

use crate::{Observation, Parameters, Quality, error::InputError};

/// Sorted, deduplicated observations with their processing mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocessed {
    /// Observations by ascending day, first occurrence of each day kept.
    observations: Vec<Observation>,
    /// Whether each observation can be used for fitting.
    mask: Vec<bool>,
    /// Aggregate cloud probability.
    cloud_prob: f64,
    /// Aggregate snow probability.
    snow_prob: f64,
    /// Aggregate water probability.
    water_prob: f64,
}

impl Preprocessed {
    /// Observations by ascending day.
    #[must_use]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Usable flag per observation.
    #[must_use]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Observations that passed the mask.
    pub fn usable(&self) -> impl Iterator<Item = &Observation> {
        self.observations
            .iter()
            .zip(&self.mask)
            .filter_map(|(observation, &usable)| usable.then_some(observation))
    }

    /// Aggregate cloud, snow and water probabilities.
    #[must_use]
    pub const fn probabilities(&self) -> (f64, f64, f64) {
        (self.cloud_prob, self.snow_prob, self.water_prob)
    }

    /// Give up the mask, consuming self.
    pub(crate) fn into_mask(self) -> Vec<bool> {
        self.mask
    }
}

/// Sort, deduplicate and mask raw observations.
///
/// # Errors
///
/// - When there are no observations.
/// - When a non-fill observation lacks a configured band.
/// - When a non-fill observation carries a classifier probability that isn't finite or outside `[0, 1]`.
/// - When fewer than `minimum_segment_length` observations are usable.
pub fn preprocess(
    observations: impl IntoIterator<Item = Observation>,
    parameters: &Parameters,
) -> Result<Preprocessed, InputError> {
    let mut observations = observations.into_iter().collect::<Vec<_>>();
    if observations.is_empty() {
        return Err(InputError::Empty);
    }

    // Stable, so the first occurrence of a day stays in front
    observations.sort_by_key(Observation::day);
    observations.dedup_by_key(|observation| observation.day());

    debug_assert!(
        observations.windows(2).all(|pair| pair[0].day() < pair[1].day()),
        "sorting and deduplication leave strictly increasing days"
    );

    let mask = observations
        .iter()
        .map(|observation| is_usable(observation, parameters))
        .collect::<Result<Vec<_>, _>>()?;

    let usable = mask.iter().filter(|&&usable| usable).count();
    if usable < parameters.minimum_segment_length {
        return Err(InputError::NotEnoughObservations {
            needed: parameters.minimum_segment_length,
            got: usable,
        });
    }

    let (cloud_prob, snow_prob, water_prob) = aggregate(&observations);

    tracing::debug!(
        observations = observations.len(),
        usable,
        cloud_prob,
        snow_prob,
        water_prob,
        "masked observations"
    );

    Ok(Preprocessed {
        observations,
        mask,
        cloud_prob,
        snow_prob,
        water_prob,
    })
}

/// Whether an observation passes quality, classifier and range checks.
fn is_usable(observation: &Observation, parameters: &Parameters) -> Result<bool, InputError> {
    if observation.quality() == Quality::Fill {
        return Ok(false);
    }

    if observation
        .ancillary()
        .is_some_and(|ancillary| !ancillary.is_valid())
    {
        return Err(InputError::InvalidProbability {
            day: observation.day(),
        });
    }

    let mut in_range = true;
    for &band in &parameters.bands {
        let value = observation
            .band(band)
            .filter(|value| value.is_finite())
            .ok_or(InputError::MissingBand {
                day: observation.day(),
                band,
            })?;

        let [low, high] = parameters.range(band);
        in_range &= (low..=high).contains(&value);
    }

    let probabilities = observation.probabilities();

    Ok(in_range
        && observation.quality().is_usable()
        && probabilities.cloud <= parameters.cloud_threshold
        && probabilities.snow <= parameters.snow_threshold)
}

/// Cloud, snow and water probabilities over every non-fill observation.
///
/// Cloud is relative to all observations, snow to the expected non-cloudy ones
/// and water to the expected non-cloudy, non-snowy ones.
fn aggregate(observations: &[Observation]) -> (f64, f64, f64) {
    let mut count = Kahan::zero();
    let mut cloud = Kahan::zero();
    let mut snow = Kahan::zero();
    let mut water = Kahan::zero();
    let mut clear_of_cloud = Kahan::zero();
    let mut clear_of_snow = Kahan::zero();

    for observation in observations
        .iter()
        .filter(|observation| observation.quality() != Quality::Fill)
    {
        let probabilities = observation.probabilities();

        count += 1.0;
        cloud += probabilities.cloud;
        snow += probabilities.snow;
        water += probabilities.water;
        clear_of_cloud += 1.0 - probabilities.cloud;
        clear_of_snow += (1.0 - probabilities.cloud - probabilities.snow).max(0.0);
    }

    (
        ratio(cloud.sum(), count.sum()),
        ratio(snow.sum(), clear_of_cloud.sum()),
        ratio(water.sum(), clear_of_snow.sum()),
    )
}

/// Division that yields zero for an empty denominator.
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        (numerator / denominator).clamp(0.0, 1.0)
    } else {
        0.0
    }
}
