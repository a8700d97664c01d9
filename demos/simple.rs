//! Example of running detection on a CSV file of observations.
//!
//! Every file is expected to have a header with `day`, `quality` and one column per band,
//! an optional TOML parameter file can be passed with `--parameters <path>`.

use std::{error::Error, fs::File};

use ccd::{Observation, Parameters, Quality};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// A row of the CSV file.
#[derive(Debug, Deserialize)]
struct Row {
    /// Ordinal day.
    day: i64,
    /// Quality class name.
    quality: Quality,
    /// Blue reflectance.
    blue: f64,
    /// Green reflectance.
    green: f64,
    /// Red reflectance.
    red: f64,
    /// Near infrared reflectance.
    nir: f64,
    /// First shortwave infrared reflectance.
    swir1: f64,
    /// Second shortwave infrared reflectance.
    swir2: f64,
    /// Brightness temperature.
    thermal: f64,
}

impl From<Row> for Observation {
    fn from(row: Row) -> Self {
        Self::new(row.day, row.quality).with_bands([
            row.blue,
            row.green,
            row.red,
            row.nir,
            row.swir1,
            row.swir2,
            row.thermal,
        ])
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut parameters = Parameters::default();
    let mut args = std::env::args().skip(1);

    // Try to read each argument as a file
    while let Some(arg) = args.next() {
        if arg == "--parameters" {
            let path = args.next().ok_or("missing path after '--parameters'")?;
            parameters = Parameters::from_path(path)?;
            continue;
        }

        eprintln!("Reading file '{arg}'");

        let mut reader = csv::Reader::from_reader(File::open(arg)?);
        let observations = reader
            .deserialize::<Row>()
            .map(|row| row.map(Observation::from))
            .collect::<Result<Vec<_>, _>>()?;

        // Run the algorithm
        match ccd::detect(observations, &parameters) {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            // Print the error
            Err(err) => eprintln!("Error running detection: {err}"),
        }
    }

    Ok(())
}
