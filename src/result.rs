//! Finalized change models and the detection result.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    Band,
    fit::{ANGULAR_FREQUENCY, COEFFICIENTS},
};

bitflags::bitflags! {
    /// Data-quality caveats of a fitted segment.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CurveQa: u8 {
        /// Normal equations needed ridge stabilization.
        const RIDGE = 1;
        /// Coordinate descent hit the iteration cap.
        const NOT_CONVERGED = 1 << 1;
        /// Fewer harmonics than configured were fitted.
        const REDUCED_ORDER = 1 << 2;
        /// All configured harmonics were fitted.
        const FULL_ORDER = 1 << 3;
        /// Trailing segment without a confirmed break.
        const UNCONFIRMED = 1 << 4;
    }
}

impl Serialize for CurveQa {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for CurveQa {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

/// Fitted curve of a single band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandModel {
    /// Slope followed by cosine and sine pairs of each harmonic.
    pub coefficients: [f64; COEFFICIENTS],
    /// Value of the curve at day zero.
    pub intercept: f64,
    /// Euclidean norm of the harmonic coefficients.
    pub magnitude: f64,
    /// Root mean square of the residuals.
    pub rmse: f64,
}

impl BandModel {
    /// Evaluate the curve on a day.
    #[must_use]
    pub fn predict(&self, day: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let day = day as f64;

        let seasonal = self.coefficients[1..]
            .chunks_exact(2)
            .zip(1_u32..)
            .map(|(pair, harmonic)| {
                let angle = f64::from(harmonic) * ANGULAR_FREQUENCY * day;
                pair[0] * angle.cos() + pair[1] * angle.sin()
            })
            .sum::<f64>();

        self.intercept + self.coefficients[0] * day + seasonal
    }
}

/// A closed segment together with the break that ended it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeModel {
    /// Day of the first observation.
    pub start_day: i64,
    /// Day of the last observation.
    pub end_day: i64,
    /// Day of the first anomalous observation, equal to `end_day` when unconfirmed.
    pub break_day: i64,
    /// Observations the curves were fitted on.
    pub observation_count: usize,
    /// Fraction of detection band votes that confirmed the break.
    pub change_probability: f64,
    /// Data-quality caveats.
    pub curve_qa: CurveQa,
    /// Fitted curve per configured band.
    #[serde(flatten)]
    pub bands: BTreeMap<Band, BandModel>,
}

impl ChangeModel {
    /// Whether the segment ended with a confirmed break.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.change_probability > 0.0
    }

    /// Fitted curve of a band, if it was configured.
    #[must_use]
    pub fn band(&self, band: Band) -> Option<&BandModel> {
        self.bands.get(&band)
    }
}

/// Outcome of a detection run on one time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Version tag of the parameters used.
    pub algorithm: String,
    /// Temporally ordered, non-overlapping change models.
    pub change_models: Vec<ChangeModel>,
    /// Usable flag per sorted and deduplicated observation.
    #[serde(with = "mask_bits")]
    pub processing_mask: Vec<bool>,
    /// Aggregate cloud probability.
    pub cloud_prob: f64,
    /// Aggregate snow probability.
    pub snow_prob: f64,
    /// Aggregate water probability.
    pub water_prob: f64,
}

/// Processing mask as a sequence of `0` and `1`.
mod mask_bits {
    use serde::{Deserialize as _, Deserializer, Serializer, de::Error as _};

    /// Serialize booleans as integers.
    pub fn serialize<S: Serializer>(mask: &[bool], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(mask.iter().map(|&usable| u8::from(usable)))
    }

    /// Deserialize integers as booleans.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<bool>, D::Error> {
        Vec::<u8>::deserialize(deserializer)?
            .into_iter()
            .map(|bit| match bit {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(D::Error::custom(format!(
                    "processing mask value {other} is not 0 or 1"
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A curve with only a first harmonic peaks where its cosine term says.
    #[test]
    fn predict() {
        let model = BandModel {
            coefficients: [0.0, 100.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            intercept: 500.0,
            magnitude: 100.0,
            rmse: 0.0,
        };

        assert!((model.predict(0) - 600.0).abs() < 1e-9, "cosine peak");
    }

    /// The quality mask round-trips through its integer form.
    #[test]
    fn curve_qa_integer() {
        let qa = CurveQa::FULL_ORDER | CurveQa::UNCONFIRMED;
        assert_eq!(qa.bits(), 24);
        assert_eq!(
            serde_json::to_string(&qa).expect("Serializing failed"),
            "24"
        );
    }

    /// Mask values other than 0 and 1 are rejected.
    #[test]
    fn mask_rejects_other_values() {
        let document = r#"{
            "algorithm": "test",
            "change_models": [],
            "processing_mask": [0, 2],
            "cloud_prob": 0.0,
            "snow_prob": 0.0,
            "water_prob": 0.0
        }"#;

        assert!(
            serde_json::from_str::<DetectionResult>(document).is_err(),
            "invalid mask accepted"
        );
    }
}
