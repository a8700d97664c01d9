//! End to end detection on synthetic series.

mod common;

use std::collections::BTreeSet;

use ccd::{
    Ancillary, Band, ChangeModel, CurveQa, Detector, Error, InputError, Parameters, State, detect,
    preprocess,
};
use serde_json::Value;

use common::{REVISIT, days, noisy_series, seasonal_curve, series, step_series};

/// Keys of a JSON object.
fn keys(value: &Value) -> BTreeSet<String> {
    value
        .as_object()
        .expect("Expected a JSON object")
        .keys()
        .cloned()
        .collect()
}

/// Check that a trailing model carries the unconfirmed markers.
fn assert_trailing(model: &ChangeModel) {
    assert_eq!(model.change_probability, 0.0);
    assert_eq!(model.break_day, model.end_day);
    assert!(
        model.curve_qa.contains(CurveQa::UNCONFIRMED),
        "trailing model not flagged"
    );
}

/// An abrupt shift splits a constant series in two.
#[test]
fn step_function() {
    let days = days(180);
    let break_day = days[90];
    let parameters = Parameters::default();

    let result = detect(step_series(&days, break_day, 500.0), &parameters)
        .expect("Detection should succeed");

    assert_eq!(result.change_models.len(), 2);

    let first = &result.change_models[0];
    assert!(first.is_confirmed(), "break not confirmed");
    assert!(first.break_day >= break_day, "break before the shift");
    assert!(
        first.break_day - break_day
            <= REVISIT * i64::try_from(parameters.confirmation_window).expect("Small window"),
        "break {} too far from {break_day}",
        first.break_day
    );
    assert_eq!(first.change_probability, 1.0);
    assert_eq!(first.end_day, days[89]);
    assert_eq!(first.observation_count, 90);

    let second = &result.change_models[1];
    assert_eq!(second.start_day, first.break_day);
    assert_eq!(second.end_day, days[179]);
    assert_trailing(second);
}

/// Noise on top of the seasonal curve doesn't hide a large shift.
#[test]
fn noisy_step_function() {
    let days = days(180);
    let break_day = days[100];
    let observations = noisy_series(&days, 7, 10.0)
        .into_iter()
        .map(|observation| {
            if observation.day() < break_day {
                return observation;
            }

            let mut shifted = observation.clone();
            for band in Band::ALL {
                let value = observation.band(band).expect("Every band is set");
                shifted = shifted.with_band(band, value + 1000.0);
            }

            shifted
        });

    let result = detect(observations, &Parameters::default()).expect("Detection should succeed");

    assert_eq!(result.change_models.len(), 2);
    assert_eq!(result.change_models[0].break_day, break_day);
    assert_trailing(&result.change_models[1]);
}

/// A series made from a fitted curve is reproduced without error and without breaks.
#[test]
fn own_curve_roundtrip() {
    let days = days(150);
    let parameters = Parameters::default();
    let source = detect(noisy_series(&days, 11, 20.0), &parameters).expect("Detection should succeed");
    let curves = source.change_models[0].bands.clone();

    let synthetic = series(&days, |day, band| curves[&band].predict(day));
    let result = detect(synthetic, &parameters).expect("Detection should succeed");

    assert_eq!(result.change_models.len(), 1);
    let model = &result.change_models[0];
    assert_trailing(model);
    assert_eq!(model.observation_count, days.len());
    for (band, fitted) in &model.bands {
        assert!(
            fitted.rmse < parameters.minimum_rmse,
            "{band} rmse {}",
            fitted.rmse
        );
    }
}

/// A plain seasonal curve yields one exact model.
#[test]
fn zero_noise_curve() {
    let days = days(120);
    let curve = seasonal_curve(2000.0, 400.0);
    let parameters = Parameters::default().with_regularization(0.0);

    let result = detect(series(&days, |day, _band| curve.predict(day)), &parameters)
        .expect("Detection should succeed");

    assert_eq!(result.change_models.len(), 1);
    let model = &result.change_models[0];
    assert_trailing(model);
    for fitted in model.bands.values() {
        assert!(fitted.rmse < 1e-3, "rmse {}", fitted.rmse);
        assert!(
            (fitted.coefficients[1] - 400.0).abs() < 1e-3,
            "cosine {}",
            fitted.coefficients[1]
        );
    }
}

/// Short runs of outliers are dropped and the segment continues.
#[test]
fn outliers_are_noise() {
    let days = days(150);
    let spikes = [days[60], days[61]];
    let observations = series(&days, |day, _band| {
        if spikes.contains(&day) { 3000.0 } else { 800.0 }
    });

    let result = detect(observations, &Parameters::default()).expect("Detection should succeed");

    assert_eq!(result.change_models.len(), 1);
    assert_eq!(result.change_models[0].observation_count, days.len() - spikes.len());
    // Held anomalies don't change the processing mask
    assert!(result.processing_mask.iter().all(|&usable| usable), "mask changed");
}

/// Identical input gives byte-identical output.
#[test]
fn deterministic() {
    let days = days(200);
    let parameters = Parameters::default();

    let first = detect(noisy_series(&days, 3, 25.0), &parameters).expect("Detection should succeed");
    let second = detect(noisy_series(&days, 3, 25.0), &parameters).expect("Detection should succeed");

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).expect("Serializing failed"),
        serde_json::to_string(&second).expect("Serializing failed")
    );
}

/// Independent invocations can run on separate threads.
#[test]
fn concurrent_invocations() {
    let days = days(160);
    let parameters = Parameters::default();
    let sequential = (0..4)
        .map(|seed| detect(noisy_series(&days, seed, 15.0), &parameters).expect("Detection failed"))
        .collect::<Vec<_>>();

    let concurrent = std::thread::scope(|scope| {
        let handles = (0..4)
            .map(|seed| {
                let days = &days;
                let parameters = &parameters;
                scope.spawn(move || detect(noisy_series(days, seed, 15.0), parameters))
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .expect("Thread panicked")
                    .expect("Detection failed")
            })
            .collect::<Vec<_>>()
    });

    assert_eq!(sequential, concurrent);
}

/// Running out of descent iterations shows up in the curve flags.
#[test]
fn iteration_cap_flagged() {
    let days = days(120);
    let parameters = Parameters::default()
        .with_regularization(20.0)
        .with_max_iterations(1);

    let result = detect(noisy_series(&days, 5, 10.0), &parameters).expect("Detection should succeed");

    assert!(!result.change_models.is_empty(), "no models");
    for model in &result.change_models {
        assert!(
            model.curve_qa.contains(CurveQa::NOT_CONVERGED),
            "cap not flagged: {:?}",
            model.curve_qa
        );
    }
}

/// A break too close to the end leaves a short window that still becomes a trailing model.
#[test]
fn trailing_leftovers() {
    let days = days(180);
    let break_day = days[160];

    let result = detect(step_series(&days, break_day, 500.0), &Parameters::default())
        .expect("Detection should succeed");

    assert_eq!(result.change_models.len(), 2);
    let first = &result.change_models[0];
    assert!(first.is_confirmed(), "break not confirmed");
    assert_eq!(first.break_day, break_day);

    // 20 observations spanning less than a year never pass initialization
    let leftover = &result.change_models[1];
    assert_trailing(leftover);
    assert_eq!(leftover.start_day, break_day);
    assert_eq!(leftover.end_day, days[179]);
    assert_eq!(leftover.observation_count, 20);
    assert!(
        leftover.curve_qa.contains(CurveQa::REDUCED_ORDER),
        "short window fitted at full order"
    );
}

/// Malformed classifier output is rejected instead of poisoning the aggregates.
#[test]
fn invalid_ancillary() {
    let days = days(60);
    let mut observations = noisy_series(&days, 2, 10.0);
    observations[30] = observations[30].clone().with_ancillary(Ancillary {
        cloud: f64::NAN,
        snow: 0.0,
        water: 0.0,
    });

    assert!(
        matches!(
            detect(observations, &Parameters::default()),
            Err(Error::Input(InputError::InvalidProbability { day })) if day == days[30]
        ),
        "NaN probability accepted"
    );
}

/// Direct curve fits check that every day has a value.
#[test]
fn fit_band_lengths() {
    let days = days(30);
    let values = vec![700.0; days.len()];
    let parameters = Parameters::default();

    assert!(
        matches!(
            ccd::fit_band(&days, &values[1..], &parameters),
            Err(Error::Input(InputError::LengthMismatch {
                days: 30,
                values: 29
            }))
        ),
        "mismatch accepted"
    );

    let fit = ccd::fit_band(&days, &values, &parameters).expect("Fit should succeed");
    assert!((fit.model.predict(days[10]) - 700.0).abs() < 1e-6, "constant not reproduced");
}

/// Too short a series is an input error, never an empty result.
#[test]
fn too_short() {
    let days = days(8);

    assert!(
        matches!(
            detect(step_series(&days, 0, 0.0), &Parameters::default()),
            Err(Error::Input(InputError::NotEnoughObservations {
                needed: 12,
                got: 8
            }))
        ),
        "short series accepted"
    );
}

/// Parameters are rejected before the observations are looked at.
#[test]
fn config_first() {
    let parameters = Parameters::default().with_confirmation_window(0);

    assert!(
        matches!(detect(Vec::new(), &parameters), Err(Error::Config(_))),
        "invalid parameters accepted"
    );
}

/// Only the configured bands are fitted and reported.
#[test]
fn band_subset() {
    let days = days(100);
    let parameters = Parameters::default()
        .with_bands([Band::Red, Band::Nir, Band::Swir1])
        .with_detection_bands([Band::Red, Band::Nir]);

    let result = detect(step_series(&days, days[50], 400.0), &parameters)
        .expect("Detection should succeed");

    for model in &result.change_models {
        assert_eq!(
            model.bands.keys().copied().collect::<Vec<_>>(),
            vec![Band::Red, Band::Nir, Band::Swir1]
        );
        assert!(model.band(Band::Blue).is_none(), "unconfigured band reported");
    }
}

/// Stepping the detector walks through every phase on a series with a break.
#[test]
fn phases() {
    let days = days(120);
    let parameters = Parameters::default();
    let preprocessed = preprocess(step_series(&days, days[60], 500.0), &parameters)
        .expect("Input should be valid");

    let mut detector = Detector::new(&preprocessed, &parameters);
    assert_eq!(detector.state(), State::Initializing);

    let mut seen = vec![State::Initializing];
    while detector.state() != State::Done {
        let state = detector.step();
        if seen.last() != Some(&state) {
            seen.push(state);
        }
    }

    assert_eq!(
        seen,
        vec![
            State::Initializing,
            State::Stable,
            State::Testing,
            State::Closing,
            State::Initializing,
            State::Stable,
            State::Done
        ]
    );
    assert_eq!(detector.models().len(), 2);
}

/// The output has the same shape as the reference result.
#[test]
fn fixture_shape() {
    let expected = common::load_result_fixture();

    let counts = expected
        .change_models
        .iter()
        .map(|model| model.observation_count)
        .collect::<Vec<_>>();
    assert_eq!(counts, vec![65, 76, 46, 35, 23]);
    assert!((expected.cloud_prob - 0.2619).abs() < 1e-4, "cloud {}", expected.cloud_prob);
    assert!((expected.snow_prob - 0.0387).abs() < 1e-4, "snow {}", expected.snow_prob);
    assert!((expected.water_prob - 0.2315).abs() < 1e-4, "water {}", expected.water_prob);
    assert_trailing(expected.change_models.last().expect("Fixture has models"));
    for pair in expected.change_models.windows(2) {
        assert!(pair[0].end_day <= pair[1].start_day, "fixture overlaps");
    }

    let days = days(180);
    let actual = detect(step_series(&days, days[90], 500.0), &Parameters::default())
        .expect("Detection should succeed");

    let expected = serde_json::to_value(&expected).expect("Serializing failed");
    let actual = serde_json::to_value(&actual).expect("Serializing failed");
    assert_eq!(keys(&actual), keys(&expected));

    let expected_model = &expected["change_models"][0];
    let band_names = Band::ALL.map(Band::name);
    for model in actual["change_models"]
        .as_array()
        .expect("Models should be a list")
    {
        assert_eq!(keys(model), keys(expected_model));

        for name in band_names {
            assert_eq!(keys(&model[name]), keys(&expected_model[name]));
            assert_eq!(
                model[name]["coefficients"].as_array().map(Vec::len),
                Some(7)
            );
        }
    }

    // Re-reading our own output gives back the same structure
    let reread: ccd::DetectionResult =
        serde_json::from_value(actual.clone()).expect("Deserializing failed");
    assert_eq!(serde_json::to_value(&reread).expect("Serializing failed"), actual);
}
