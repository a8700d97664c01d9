//! Input records.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Spectral band of a surface reflectance observation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    /// Visible blue.
    Blue,
    /// Visible green.
    Green,
    /// Visible red.
    Red,
    /// Near infrared.
    Nir,
    /// First shortwave infrared.
    Swir1,
    /// Second shortwave infrared.
    Swir2,
    /// Brightness temperature.
    Thermal,
}

impl Band {
    /// Amount of bands an observation can carry.
    pub const COUNT: usize = 7;

    /// All bands in output order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Blue,
        Self::Green,
        Self::Red,
        Self::Nir,
        Self::Swir1,
        Self::Swir2,
        Self::Thermal,
    ];

    /// Position in [`Self::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Lowercase name, as used in results.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Red => "red",
            Self::Nir => "nir",
            Self::Swir1 => "swir1",
            Self::Swir2 => "swir2",
            Self::Thermal => "thermal",
        }
    }
}

impl Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pixel quality classification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    /// No data.
    Fill,
    /// Clear land.
    #[default]
    Clear,
    /// Clear water.
    Water,
    /// Cloud shadow.
    Shadow,
    /// Snow or ice.
    Snow,
    /// Cloud.
    Cloud,
    /// Radiometric saturation.
    Saturated,
}

impl Quality {
    /// Whether the classification allows the observation to be used.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Clear | Self::Water)
    }

    /// Cloud indicator used when no ancillary estimate is supplied.
    pub(crate) const fn cloud_indicator(self) -> f64 {
        if matches!(self, Self::Cloud | Self::Shadow) {
            1.0
        } else {
            0.0
        }
    }

    /// Snow indicator used when no ancillary estimate is supplied.
    pub(crate) const fn snow_indicator(self) -> f64 {
        if matches!(self, Self::Snow) { 1.0 } else { 0.0 }
    }

    /// Water indicator used when no ancillary estimate is supplied.
    pub(crate) const fn water_indicator(self) -> f64 {
        if matches!(self, Self::Water) { 1.0 } else { 0.0 }
    }
}

/// Probability estimates from external cloud, snow and water classifiers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ancillary {
    /// Probability of cloud contamination.
    pub cloud: f64,
    /// Probability of snow cover.
    pub snow: f64,
    /// Probability of open water.
    pub water: f64,
}

impl Ancillary {
    /// Whether every probability is finite and within `[0, 1]`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.cloud, self.snow, self.water]
            .iter()
            .all(|probability| (0.0..=1.0).contains(probability))
    }
}

/// A single dated multispectral observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Ordinal day.
    day: i64,
    /// Reflectance per band, indexed by [`Band::index`].
    reflectance: [Option<f64>; Band::COUNT],
    /// Quality classification.
    quality: Quality,
    /// Optional classifier estimates.
    ancillary: Option<Ancillary>,
}

impl Observation {
    /// Construct an observation without any band values.
    #[must_use]
    pub const fn new(day: i64, quality: Quality) -> Self {
        Self {
            day,
            reflectance: [None; Band::COUNT],
            quality,
            ancillary: None,
        }
    }

    /// Set the value of a band.
    #[must_use]
    pub const fn with_band(mut self, band: Band, value: f64) -> Self {
        self.reflectance[band.index()] = Some(value);

        self
    }

    /// Set every band from a value per band in [`Band::ALL`] order.
    #[must_use]
    pub fn with_bands(mut self, values: [f64; Band::COUNT]) -> Self {
        self.reflectance = values.map(Some);

        self
    }

    /// Attach classifier probabilities.
    #[must_use]
    pub const fn with_ancillary(mut self, ancillary: Ancillary) -> Self {
        self.ancillary = Some(ancillary);

        self
    }

    /// Ordinal day.
    #[must_use]
    pub const fn day(&self) -> i64 {
        self.day
    }

    /// Value of a band, if present.
    #[must_use]
    pub const fn band(&self, band: Band) -> Option<f64> {
        self.reflectance[band.index()]
    }

    /// Quality classification.
    #[must_use]
    pub const fn quality(&self) -> Quality {
        self.quality
    }

    /// Classifier probabilities, if supplied.
    #[must_use]
    pub const fn ancillary(&self) -> Option<Ancillary> {
        self.ancillary
    }

    /// Cloud, snow and water probabilities, falling back to the quality class.
    pub(crate) fn probabilities(&self) -> Ancillary {
        self.ancillary.unwrap_or(Ancillary {
            cloud: self.quality.cloud_indicator(),
            snow: self.quality.snow_indicator(),
            water: self.quality.water_indicator(),
        })
    }
}
