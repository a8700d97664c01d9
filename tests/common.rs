//! Shared functionality between integration tests.

use ccd::{Band, BandModel, DetectionResult, Observation, Quality};
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};

/// Ordinal day of 1990-01-01.
pub const FIRST_DAY: i64 = 726_468;

/// Revisit interval of a single sensor.
pub const REVISIT: i64 = 16;

/// Evenly spaced days starting at [`FIRST_DAY`].
#[must_use]
pub fn days(count: usize) -> Vec<i64> {
    (0..count)
        .map(|index| FIRST_DAY + REVISIT * i64::try_from(index).expect("Index too large"))
        .collect()
}

/// Clear observations with every band set by `value`.
#[must_use]
pub fn series(days: &[i64], mut value: impl FnMut(i64, Band) -> f64) -> Vec<Observation> {
    days.iter()
        .map(|&day| {
            Observation::new(day, Quality::Clear).with_bands(Band::ALL.map(|band| value(day, band)))
        })
        .collect()
}

/// Constant reflectance that jumps by `shift` on `break_day`.
#[must_use]
pub fn step_series(days: &[i64], break_day: i64, shift: f64) -> Vec<Observation> {
    series(days, |day, band| {
        let base = 500.0 + 100.0 * f64::from(u8::try_from(band.index()).expect("Few bands"));
        if day >= break_day { base + shift } else { base }
    })
}

/// A seasonal curve with a first harmonic and no trend.
#[must_use]
pub fn seasonal_curve(intercept: f64, amplitude: f64) -> BandModel {
    BandModel {
        coefficients: [0.0, amplitude, amplitude / 2.0, 0.0, 0.0, 0.0, 0.0],
        intercept,
        magnitude: 0.0,
        rmse: 0.0,
    }
}

/// Seasonal curves with gaussian-like noise, deterministic per seed.
#[must_use]
pub fn noisy_series(days: &[i64], seed: u64, noise: f64) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let curve = seasonal_curve(1500.0, 300.0);

    series(days, |day, _band| {
        // Sum of uniforms is close enough to a normal distribution
        let jitter = (0..4).map(|_| rng.random_range(-1.0..1.0)).sum::<f64>() / 2.0;

        curve.predict(day) + noise * jitter
    })
}

/// Load the expected result fixture.
#[must_use]
pub fn load_result_fixture() -> DetectionResult {
    serde_json::from_str(include_str!("fixtures/expected-result.json"))
        .expect("Error deserializing the result fixture")
}
